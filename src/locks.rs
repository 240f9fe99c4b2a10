//! Item lock registry.
//!
//! An item is locked while an accepted exchange holds it. Acquisition is a
//! single conditional update, so of two transactions racing for the same
//! item exactly one sees `true`.

use crate::{catalog, ItemId, Result};
use sqlx::SqliteConnection;

/// Lock `item_id` if it is currently unlocked and not deleted. Returns
/// whether this call acquired the lock; contention is not an error.
pub async fn try_lock(conn: &mut SqliteConnection, item_id: ItemId) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE items SET is_locked = 1 WHERE id = ? AND is_locked = 0 AND is_deleted = 0",
    )
    .bind(item_id)
    .execute(&mut *conn)
    .await?;

    let acquired = result.rows_affected() == 1;
    tracing::debug!(item_id, acquired, "Item lock attempt");
    Ok(acquired)
}

/// Clear the lock flag unconditionally.
pub async fn unlock(conn: &mut SqliteConnection, item_id: ItemId) -> Result<()> {
    catalog::set_locked(conn, item_id, false).await?;
    tracing::debug!(item_id, "Item unlocked");
    Ok(())
}

pub async fn is_locked(conn: &mut SqliteConnection, item_id: ItemId) -> Result<bool> {
    let locked: Option<bool> = sqlx::query_scalar("SELECT is_locked FROM items WHERE id = ?")
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(locked.unwrap_or(false))
}
