//! Item catalog: listing, lookup and soft deletion of bartered items.

use crate::{model::Item, ExchangeError, ItemId, Result, UserId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

const ITEM_COLUMNS: &str =
    "id, user_id, item_name, item_type, item_description, is_locked, is_deleted, created_at";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    pub owner_id: UserId,
    pub name: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub description: String,
}

/// Partial update. Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub item_type: Option<String>,
    pub description: Option<String>,
}

pub async fn create_item(conn: &mut SqliteConnection, item: &NewItem) -> Result<Item> {
    if item.name.trim().is_empty() {
        return Err(ExchangeError::InvalidInput("item name is required".to_string()));
    }

    let owner_exists = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(item.owner_id)
        .fetch_optional(&mut *conn)
        .await?;
    if owner_exists.is_none() {
        return Err(ExchangeError::InvalidReference(format!("User {}", item.owner_id)));
    }

    let now = Utc::now();
    let id = sqlx::query(
        r#"
        INSERT INTO items
            (user_id, item_name, item_type, item_description, is_locked, is_deleted, created_at)
        VALUES (?, ?, ?, ?, 0, 0, ?)
        "#,
    )
    .bind(item.owner_id)
    .bind(&item.name)
    .bind(&item.item_type)
    .bind(&item.description)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(Item {
        id,
        owner_id: item.owner_id,
        name: item.name.clone(),
        item_type: item.item_type.clone(),
        description: item.description.clone(),
        is_locked: false,
        is_deleted: false,
        created_at: now,
    })
}

pub async fn get_item(conn: &mut SqliteConnection, item_id: ItemId) -> Result<Option<Item>> {
    let row = sqlx::query(&format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS))
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|row| item_from_row(&row)).transpose()
}

pub async fn is_deleted(conn: &mut SqliteConnection, item_id: ItemId) -> Result<bool> {
    let deleted: Option<bool> = sqlx::query_scalar("SELECT is_deleted FROM items WHERE id = ?")
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await?;

    deleted.ok_or_else(|| ExchangeError::NotFound(format!("Item {}", item_id)))
}

/// Unconditional flag write. Exchange transitions go through
/// [`crate::locks`] instead, which only locks an unlocked item.
pub async fn set_locked(conn: &mut SqliteConnection, item_id: ItemId, locked: bool) -> Result<()> {
    let result = sqlx::query("UPDATE items SET is_locked = ? WHERE id = ?")
        .bind(locked)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ExchangeError::NotFound(format!("Item {}", item_id)));
    }
    Ok(())
}

/// Items are never physically removed because exchanges keep referring to
/// them. An item committed to an exchange cannot be deleted, and deleting
/// twice reports the item as gone.
pub async fn soft_delete(conn: &mut SqliteConnection, item_id: ItemId) -> Result<()> {
    let result = sqlx::query(
        "UPDATE items SET is_deleted = 1 WHERE id = ? AND is_locked = 0 AND is_deleted = 0",
    )
    .bind(item_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        if is_deleted(conn, item_id).await? {
            return Err(ExchangeError::NotFound(format!("Item {}", item_id)));
        }
        return Err(ExchangeError::ItemUnavailable(format!(
            "Item {} is committed to an exchange",
            item_id
        )));
    }
    Ok(())
}

/// Apply `patch` to an item that is neither locked nor deleted.
pub async fn update_item(
    conn: &mut SqliteConnection,
    item_id: ItemId,
    patch: &ItemPatch,
) -> Result<Item> {
    if patch.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(ExchangeError::InvalidInput("item name cannot be empty".to_string()));
    }

    let result = sqlx::query(
        r#"
        UPDATE items SET
            item_name = COALESCE(?, item_name),
            item_type = COALESCE(?, item_type),
            item_description = COALESCE(?, item_description)
        WHERE id = ? AND is_locked = 0 AND is_deleted = 0
        "#,
    )
    .bind(&patch.name)
    .bind(&patch.item_type)
    .bind(&patch.description)
    .bind(item_id)
    .execute(&mut *conn)
    .await?;

    match get_item(conn, item_id).await? {
        Some(item) if result.rows_affected() == 1 => Ok(item),
        Some(item) if item.is_locked && !item.is_deleted => Err(ExchangeError::ItemUnavailable(
            format!("Item {} is committed to an exchange", item_id),
        )),
        _ => Err(ExchangeError::NotFound(format!("Item {}", item_id))),
    }
}

/// Available items whose name contains `query` (case-insensitive) and whose
/// type equals `item_type`. Either filter may be omitted.
pub async fn search(
    conn: &mut SqliteConnection,
    query: Option<&str>,
    item_type: Option<&str>,
) -> Result<Vec<Item>> {
    let query = query.map(str::trim).filter(|q| !q.is_empty());
    let item_type = item_type.map(str::trim).filter(|t| !t.is_empty());

    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM items
        WHERE is_locked = 0 AND is_deleted = 0
          AND (?1 IS NULL OR item_name LIKE '%' || ?1 || '%')
          AND (?2 IS NULL OR item_type = ?2)
        ORDER BY id
        "#,
        ITEM_COLUMNS
    ))
    .bind(query)
    .bind(item_type)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Items of a user that can still be offered: neither locked nor deleted.
pub async fn list_available(conn: &mut SqliteConnection, owner_id: UserId) -> Result<Vec<Item>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM items WHERE user_id = ? AND is_locked = 0 AND is_deleted = 0 ORDER BY id",
        ITEM_COLUMNS
    ))
    .bind(owner_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(item_from_row).collect()
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        owner_id: row.try_get("user_id")?,
        name: row.try_get("item_name")?,
        item_type: row.try_get("item_type")?,
        description: row.try_get("item_description")?,
        is_locked: row.try_get("is_locked")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
    })
}
