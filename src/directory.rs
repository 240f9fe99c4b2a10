//! User directory: the slice of account management the exchange engine needs.

use crate::{model::User, ExchangeError, Result, UserId};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

pub async fn create_user(conn: &mut SqliteConnection, username: &str, email: &str) -> Result<User> {
    if username.trim().is_empty() || email.trim().is_empty() {
        return Err(ExchangeError::InvalidInput(
            "username and email are required".to_string(),
        ));
    }

    let exists = sqlx::query("SELECT 1 FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_some() {
        return Err(ExchangeError::InvalidInput(format!("User {} already exists", email)));
    }

    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO users (username, email, is_banned, created_at) VALUES (?, ?, 0, ?)",
    )
    .bind(username)
    .bind(email)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(User {
        id,
        username: username.to_string(),
        email: email.to_string(),
        is_banned: false,
        created_at: now,
    })
}

pub async fn get_user(conn: &mut SqliteConnection, user_id: UserId) -> Result<Option<User>> {
    let row =
        sqlx::query("SELECT id, username, email, is_banned, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|row| user_from_row(&row)).transpose()
}

pub async fn is_banned(conn: &mut SqliteConnection, user_id: UserId) -> Result<bool> {
    let banned: Option<bool> = sqlx::query_scalar("SELECT is_banned FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

    banned.ok_or_else(|| ExchangeError::NotFound(format!("User {}", user_id)))
}

/// Admin ban toggle.
pub async fn set_banned(conn: &mut SqliteConnection, user_id: UserId, banned: bool) -> Result<()> {
    let result = sqlx::query("UPDATE users SET is_banned = ? WHERE id = ?")
        .bind(banned)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ExchangeError::NotFound(format!("User {}", user_id)));
    }

    tracing::info!(user_id, banned, "User ban status changed");
    Ok(())
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        is_banned: row.try_get("is_banned")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::temp_database;

    #[tokio::test]
    async fn test_create_and_ban_user() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let user = create_user(&mut conn, "somchai", "somchai@example.com").await.unwrap();
        assert!(!is_banned(&mut conn, user.id).await.unwrap());

        set_banned(&mut conn, user.id, true).await.unwrap();
        assert!(is_banned(&mut conn, user.id).await.unwrap());

        let fetched = get_user(&mut conn, user.id).await.unwrap().unwrap();
        assert_eq!(fetched.username, "somchai");
        assert!(fetched.is_banned);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();

        create_user(&mut conn, "a", "dup@example.com").await.unwrap();
        let err = create_user(&mut conn, "b", "dup@example.com").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();

        assert!(get_user(&mut conn, 42).await.unwrap().is_none());
        assert!(matches!(is_banned(&mut conn, 42).await, Err(ExchangeError::NotFound(_))));
        assert!(matches!(set_banned(&mut conn, 42, true).await, Err(ExchangeError::NotFound(_))));
    }
}
