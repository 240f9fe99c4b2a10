//! SQLite storage handle shared by every component.
//!
//! State-changing transitions run inside a single transaction whose first
//! statement is a write. SQLite then acquires the write lock before the
//! transition reads anything, so two conflicting transitions never
//! interleave: the second one waits (bounded by the busy timeout) and then
//! observes the first one's committed state.

use crate::{config::DatabaseConfig, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .min_connections(config.min_connections.unwrap_or(1))
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!(url = %config.url, "Database ready");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                is_banned INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                item_name TEXT NOT NULL,
                item_type TEXT NOT NULL DEFAULT '',
                item_description TEXT NOT NULL DEFAULT '',
                is_locked INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchanger_id INTEGER NOT NULL,
                owner_id INTEGER NOT NULL,
                offered_item_id INTEGER NOT NULL,
                selected_item_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                exchange_result TEXT,
                accepted_at DATETIME,
                owner_confirmed_at DATETIME,
                exchanger_confirmed_at DATETIME,
                cancellation_reason TEXT,
                cancelled_by INTEGER,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (exchanger_id) REFERENCES users(id),
                FOREIGN KEY (owner_id) REFERENCES users(id),
                FOREIGN KEY (offered_item_id) REFERENCES items(id),
                FOREIGN KEY (selected_item_id) REFERENCES items(id)
            );

            CREATE TABLE IF NOT EXISTS credits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                exchange_id INTEGER NOT NULL,
                points INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                UNIQUE (user_id, exchange_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (exchange_id) REFERENCES exchanges(id)
            );

            CREATE TABLE IF NOT EXISTS discredits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                exchange_id INTEGER NOT NULL,
                points INTEGER NOT NULL,
                reason TEXT,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (exchange_id) REFERENCES exchanges(id)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                exchange_id INTEGER,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (exchange_id) REFERENCES exchanges(id)
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_owner ON items(user_id);
            CREATE INDEX IF NOT EXISTS idx_exchanges_owner ON exchanges(owner_id);
            CREATE INDEX IF NOT EXISTS idx_exchanges_exchanger ON exchanges(exchanger_id);
            CREATE INDEX IF NOT EXISTS idx_exchanges_selected
                ON exchanges(selected_item_id, status);
            CREATE INDEX IF NOT EXISTS idx_discredits_user ON discredits(user_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications(user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_activity_user ON activity_log(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::temp_database;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let (db, _dir) = temp_database().await;
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "activity_log",
                "credits",
                "discredits",
                "exchanges",
                "items",
                "notifications",
                "users",
            ]
        );
    }
}
