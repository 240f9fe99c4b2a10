//! Notification dispatcher.
//!
//! A notification is first written as a row (inside the caller's
//! transaction when there is one) and only pushed to live subscribers after
//! that row is durable. Push is best-effort: a missing or lagging subscriber
//! never fails the operation that produced the notification.

use crate::{model::Notification, ExchangeError, ExchangeId, NotificationId, Result, UserId};
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capability to deliver a stored notification to whoever is listening for
/// its recipient. Returns whether any live subscriber received it.
#[cfg_attr(test, mockall::automock)]
pub trait Publisher: Send + Sync {
    fn publish(&self, notification: &Notification) -> bool;
}

/// Per-user broadcast channels for connected clients.
pub struct SubscriberHub {
    channels: Mutex<HashMap<UserId, broadcast::Sender<Notification>>>,
    capacity: usize,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a receiver for `user_id`. Channels of users whose streams have
    /// all closed are dropped here as well as on publish.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Notification> {
        let mut channels = self.channels.lock();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.channels
            .lock()
            .get(&user_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Publisher for SubscriberHub {
    fn publish(&self, notification: &Notification) -> bool {
        let mut channels = self.channels.lock();
        let Some(sender) = channels.get(&notification.user_id) else {
            return false;
        };

        match sender.send(notification.clone()) {
            Ok(receivers) => {
                tracing::trace!(user_id = notification.user_id, receivers, "Notification pushed");
                true
            }
            Err(_) => {
                // Every receiver is gone.
                channels.remove(&notification.user_id);
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    publisher: Arc<dyn Publisher>,
}

impl NotificationDispatcher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Persist a notification row without pushing it. Use inside a
    /// transaction and hand the result to [`publish_all`] after commit.
    ///
    /// [`publish_all`]: NotificationDispatcher::publish_all
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
        message: &str,
        exchange_id: Option<ExchangeId>,
    ) -> Result<Notification> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, message, exchange_id, is_read, created_at)
            VALUES (?, ?, ?, 0, ?)
            "#,
        )
        .bind(user_id)
        .bind(message)
        .bind(exchange_id)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(Notification {
            id,
            user_id,
            message: message.to_string(),
            exchange_id,
            is_read: false,
            created_at: now,
        })
    }

    pub fn publish_all(&self, notifications: &[Notification]) {
        for notification in notifications {
            if !self.publisher.publish(notification) {
                tracing::debug!(
                    user_id = notification.user_id,
                    notification_id = notification.id,
                    "No live subscriber; notification kept for later reads"
                );
            }
        }
    }

    /// Persist and push in one step, outside of any exchange transition.
    pub async fn notify(
        &self,
        pool: &SqlitePool,
        user_id: UserId,
        message: &str,
        exchange_id: Option<ExchangeId>,
    ) -> Result<Notification> {
        let mut conn = pool.acquire().await?;
        let notification = self.record(&mut conn, user_id, message, exchange_id).await?;
        self.publish_all(std::slice::from_ref(&notification));
        Ok(notification)
    }
}

pub async fn list_for_user(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> Result<Vec<Notification>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, message, exchange_id, is_read, created_at
        FROM notifications WHERE user_id = ?
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(notification_from_row).collect()
}

pub async fn mark_read(conn: &mut SqliteConnection, notification_id: NotificationId) -> Result<()> {
    let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ?")
        .bind(notification_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ExchangeError::NotFound(format!("Notification {}", notification_id)));
    }
    Ok(())
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        message: row.try_get("message")?,
        exchange_id: row.try_get("exchange_id")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}
