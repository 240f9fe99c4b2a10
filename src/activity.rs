//! Append-only activity log.

use crate::{model::ActivityEntry, Result, UserId};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};

pub async fn log(
    conn: &mut SqliteConnection,
    user_id: UserId,
    action: &str,
    details: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO activity_log (user_id, action, details, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(action)
    .bind(serde_json::to_string(details)?)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn list_for_user(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> Result<Vec<ActivityEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, action, details, created_at
        FROM activity_log WHERE user_id = ?
        ORDER BY id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let details: String = row.try_get("details")?;
        entries.push(ActivityEntry {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            action: row.try_get("action")?,
            details: serde_json::from_str(&details)?,
            created_at: row.try_get("created_at")?,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::temp_database;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_is_listed_newest_first() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();

        log(&mut conn, 3, "exchange.proposed", &json!({"exchange_id": 1}))
            .await
            .unwrap();
        log(
            &mut conn,
            3,
            "exchange.cancelled",
            &json!({"exchange_id": 1, "reason": "moved"}),
        )
        .await
        .unwrap();
        log(&mut conn, 4, "exchange.accepted", &json!({"exchange_id": 2}))
            .await
            .unwrap();

        let entries = list_for_user(&mut conn, 3).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "exchange.cancelled");
        assert_eq!(entries[0].details["reason"], "moved");
        assert_eq!(entries[1].action, "exchange.proposed");
    }
}
