//! Exchange record store. One row per proposal, never deleted.
//!
//! Every mutation is a single conditional update guarded by the state it
//! expects to find. Each returns whether the row matched; callers translate
//! a miss into the precise error after re-reading the row.

use crate::{
    model::{ExchangeProposal, ExchangeResult, ExchangeStatus, Party},
    ExchangeError, ExchangeId, ItemId, Result, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

const EXCHANGE_COLUMNS: &str = "id, exchanger_id, owner_id, offered_item_id, selected_item_id, \
     status, exchange_result, accepted_at, owner_confirmed_at, exchanger_confirmed_at, \
     cancellation_reason, cancelled_by, created_at";

/// Reason recorded on pending proposals cancelled because a competing
/// proposal for the same item was accepted.
pub const SUPERSEDED_REASON: &str = "another exchange for this item was accepted";

/// Insert a pending proposal. The insert only happens while both items exist,
/// are unlocked and are not deleted.
pub async fn create(
    conn: &mut SqliteConnection,
    proposer_id: UserId,
    owner_id: UserId,
    offered_item_id: ItemId,
    selected_item_id: ItemId,
) -> Result<ExchangeProposal> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO exchanges
            (exchanger_id, owner_id, offered_item_id, selected_item_id, status, created_at)
        SELECT ?, ?, ?, ?, 'pending', ?
        WHERE (
            SELECT COUNT(*) FROM items
            WHERE id IN (?, ?) AND is_locked = 0 AND is_deleted = 0
        ) = 2
        "#,
    )
    .bind(proposer_id)
    .bind(owner_id)
    .bind(offered_item_id)
    .bind(selected_item_id)
    .bind(now)
    .bind(offered_item_id)
    .bind(selected_item_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        for item_id in [offered_item_id, selected_item_id] {
            let exists = sqlx::query("SELECT 1 FROM items WHERE id = ?")
                .bind(item_id)
                .fetch_optional(&mut *conn)
                .await?;
            if exists.is_none() {
                return Err(ExchangeError::InvalidReference(format!("Item {}", item_id)));
            }
        }
        return Err(ExchangeError::ItemUnavailable(format!(
            "Item {} or {} is locked or deleted",
            offered_item_id, selected_item_id
        )));
    }

    Ok(ExchangeProposal {
        id: result.last_insert_rowid(),
        exchanger_id: proposer_id,
        owner_id,
        offered_item_id,
        selected_item_id,
        status: ExchangeStatus::Pending,
        exchange_result: None,
        accepted_at: None,
        owner_confirmed_at: None,
        exchanger_confirmed_at: None,
        cancellation_reason: None,
        cancelled_by: None,
        created_at: now,
    })
}

pub async fn get(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
) -> Result<Option<ExchangeProposal>> {
    let row = sqlx::query(&format!("SELECT {} FROM exchanges WHERE id = ?", EXCHANGE_COLUMNS))
        .bind(exchange_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|row| exchange_from_row(&row)).transpose()
}

pub async fn require(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
) -> Result<ExchangeProposal> {
    get(conn, exchange_id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound(format!("Exchange {}", exchange_id)))
}

/// Proposals where the user is either side, most recent first.
pub async fn list_for_user(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> Result<Vec<ExchangeProposal>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM exchanges
        WHERE exchanger_id = ? OR owner_id = ?
        ORDER BY created_at DESC, id DESC
        "#,
        EXCHANGE_COLUMNS
    ))
    .bind(user_id)
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(exchange_from_row).collect()
}

/// Owner decision on a pending proposal. Matches only when the caller's
/// owner and selected item agree with the stored row.
pub async fn decide(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
    owner_id: UserId,
    selected_item_id: ItemId,
    decision: ExchangeStatus,
    at: DateTime<Utc>,
) -> Result<bool> {
    debug_assert!(matches!(decision, ExchangeStatus::Accepted | ExchangeStatus::Rejected));
    let accepted_at = (decision == ExchangeStatus::Accepted).then_some(at);

    let result = sqlx::query(
        r#"
        UPDATE exchanges SET status = ?, accepted_at = COALESCE(?, accepted_at)
        WHERE id = ? AND owner_id = ? AND selected_item_id = ? AND status = 'pending'
        "#,
    )
    .bind(decision.as_str())
    .bind(accepted_at)
    .bind(exchange_id)
    .bind(owner_id)
    .bind(selected_item_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Stamp one side's receipt confirmation. Only matches an accepted,
/// unsettled exchange whose `party` side is `user_id` and not yet stamped.
pub async fn set_confirmation(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
    party: Party,
    user_id: UserId,
    at: DateTime<Utc>,
) -> Result<bool> {
    let sql = match party {
        Party::Owner => {
            r#"
            UPDATE exchanges SET owner_confirmed_at = ?
            WHERE id = ? AND owner_id = ? AND owner_confirmed_at IS NULL
              AND status = 'accepted' AND exchange_result IS NULL
            "#
        }
        Party::Exchanger => {
            r#"
            UPDATE exchanges SET exchanger_confirmed_at = ?
            WHERE id = ? AND exchanger_id = ? AND exchanger_confirmed_at IS NULL
              AND status = 'accepted' AND exchange_result IS NULL
            "#
        }
    };

    let result = sqlx::query(sql)
        .bind(at)
        .bind(exchange_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Settle an accepted exchange. A second settlement never matches.
pub async fn set_result(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
    result: ExchangeResult,
) -> Result<bool> {
    let outcome = sqlx::query(
        r#"
        UPDATE exchanges SET exchange_result = ?
        WHERE id = ? AND status = 'accepted' AND exchange_result IS NULL
        "#,
    )
    .bind(result.as_str())
    .bind(exchange_id)
    .execute(&mut *conn)
    .await?;

    Ok(outcome.rows_affected() == 1)
}

/// Cancel an unsettled pending or accepted exchange on behalf of one of its
/// parties. A pending proposal also moves to `cancelled`; an accepted one
/// keeps its status and is settled as cancelled.
pub async fn set_cancellation(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
    cancelled_by: UserId,
    reason: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE exchanges SET
            exchange_result = 'cancelled',
            cancellation_reason = ?,
            cancelled_by = ?,
            status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END
        WHERE id = ? AND (owner_id = ? OR exchanger_id = ?)
          AND status IN ('pending', 'accepted') AND exchange_result IS NULL
        "#,
    )
    .bind(reason)
    .bind(cancelled_by)
    .bind(exchange_id)
    .bind(cancelled_by)
    .bind(cancelled_by)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Cancel every other pending proposal that offers the same selected item as
/// `accepted`. Returns the cancelled proposals as they now stand.
pub async fn cancel_competing(
    conn: &mut SqliteConnection,
    accepted: &ExchangeProposal,
) -> Result<Vec<ExchangeProposal>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM exchanges WHERE selected_item_id = ? AND id != ? AND status = 'pending'",
        EXCHANGE_COLUMNS
    ))
    .bind(accepted.selected_item_id)
    .bind(accepted.id)
    .fetch_all(&mut *conn)
    .await?;

    let mut cancelled = rows.iter().map(exchange_from_row).collect::<Result<Vec<_>>>()?;
    if cancelled.is_empty() {
        return Ok(cancelled);
    }

    sqlx::query(
        r#"
        UPDATE exchanges SET
            status = 'cancelled',
            exchange_result = 'cancelled',
            cancellation_reason = ?,
            cancelled_by = NULL
        WHERE selected_item_id = ? AND id != ? AND status = 'pending'
        "#,
    )
    .bind(SUPERSEDED_REASON)
    .bind(accepted.selected_item_id)
    .bind(accepted.id)
    .execute(&mut *conn)
    .await?;

    for exchange in &mut cancelled {
        exchange.status = ExchangeStatus::Cancelled;
        exchange.exchange_result = Some(ExchangeResult::Cancelled);
        exchange.cancellation_reason = Some(SUPERSEDED_REASON.to_string());
        exchange.cancelled_by = None;
    }

    Ok(cancelled)
}

fn exchange_from_row(row: &SqliteRow) -> Result<ExchangeProposal> {
    let status: String = row.try_get("status")?;
    let exchange_result: Option<String> = row.try_get("exchange_result")?;

    Ok(ExchangeProposal {
        id: row.try_get("id")?,
        exchanger_id: row.try_get("exchanger_id")?,
        owner_id: row.try_get("owner_id")?,
        offered_item_id: row.try_get("offered_item_id")?,
        selected_item_id: row.try_get("selected_item_id")?,
        status: status.parse()?,
        exchange_result: exchange_result.map(|r| r.parse()).transpose()?,
        accepted_at: row.try_get("accepted_at")?,
        owner_confirmed_at: row.try_get("owner_confirmed_at")?,
        exchanger_confirmed_at: row.try_get("exchanger_confirmed_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        cancelled_by: row.try_get("cancelled_by")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, NewItem};
    use crate::database::testing::temp_database;
    use crate::{directory, locks};

    struct Fixture {
        exchanger: UserId,
        owner: UserId,
        offered: ItemId,
        selected: ItemId,
    }

    fn new_item(owner_id: UserId, name: &str) -> NewItem {
        NewItem {
            owner_id,
            name: name.to_string(),
            item_type: String::new(),
            description: String::new(),
        }
    }

    async fn fixture(conn: &mut SqliteConnection) -> Fixture {
        let exchanger = directory::create_user(conn, "exchanger", "x@example.com").await.unwrap();
        let owner = directory::create_user(conn, "owner", "o@example.com").await.unwrap();
        let offered = catalog::create_item(conn, &new_item(owner.id, "guitar")).await.unwrap();
        let selected = catalog::create_item(conn, &new_item(exchanger.id, "camera")).await.unwrap();

        Fixture {
            exchanger: exchanger.id,
            owner: owner.id,
            offered: offered.id,
            selected: selected.id,
        }
    }

    async fn propose(conn: &mut SqliteConnection, f: &Fixture) -> ExchangeId {
        create(conn, f.exchanger, f.owner, f.offered, f.selected)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_create_requires_available_items() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let f = fixture(&mut conn).await;

        let err = create(&mut conn, f.exchanger, f.owner, 999, f.selected).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidReference(_)));

        locks::try_lock(&mut conn, f.selected).await.unwrap();
        let err = create(&mut conn, f.exchanger, f.owner, f.offered, f.selected)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ItemUnavailable(_)));

        locks::unlock(&mut conn, f.selected).await.unwrap();
        let id = propose(&mut conn, &f).await;
        let stored = require(&mut conn, id).await.unwrap();
        assert_eq!(stored.status, ExchangeStatus::Pending);
        assert_eq!(stored.exchange_result, None);
    }

    #[tokio::test]
    async fn test_decide_is_guarded_by_owner_item_and_status() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let f = fixture(&mut conn).await;
        let id = propose(&mut conn, &f).await;
        let now = Utc::now();
        let accepted = ExchangeStatus::Accepted;

        let by_stranger = decide(&mut conn, id, f.exchanger, f.selected, accepted, now).await;
        assert!(!by_stranger.unwrap());
        let wrong_item = decide(&mut conn, id, f.owner, f.offered, accepted, now).await;
        assert!(!wrong_item.unwrap());
        assert!(decide(&mut conn, id, f.owner, f.selected, accepted, now).await.unwrap());

        let rejected = ExchangeStatus::Rejected;
        let after_accept = decide(&mut conn, id, f.owner, f.selected, rejected, now).await;
        assert!(!after_accept.unwrap());

        let stored = require(&mut conn, id).await.unwrap();
        assert_eq!(stored.status, ExchangeStatus::Accepted);
        assert!(stored.accepted_at.is_some());
        assert!(stored.owner_confirmed_at.is_none());
    }

    #[tokio::test]
    async fn test_confirmation_is_stamped_once() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let f = fixture(&mut conn).await;
        let id = propose(&mut conn, &f).await;
        let now = Utc::now();

        let while_pending = set_confirmation(&mut conn, id, Party::Owner, f.owner, now).await;
        assert!(!while_pending.unwrap());

        decide(&mut conn, id, f.owner, f.selected, ExchangeStatus::Accepted, now)
            .await
            .unwrap();
        assert!(set_confirmation(&mut conn, id, Party::Owner, f.owner, now).await.unwrap());
        assert!(!set_confirmation(&mut conn, id, Party::Owner, f.owner, now).await.unwrap());
        let wrong_side = set_confirmation(&mut conn, id, Party::Exchanger, f.owner, now).await;
        assert!(!wrong_side.unwrap());

        assert!(set_result(&mut conn, id, ExchangeResult::Completed).await.unwrap());
        assert!(!set_result(&mut conn, id, ExchangeResult::Completed).await.unwrap());
        assert!(!set_cancellation(&mut conn, id, f.owner, "too late").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancellation_of_pending_proposal_is_terminal() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let f = fixture(&mut conn).await;
        let id = propose(&mut conn, &f).await;

        assert!(!set_cancellation(&mut conn, id, 4242, "not mine").await.unwrap());
        assert!(set_cancellation(&mut conn, id, f.exchanger, "changed mind").await.unwrap());

        let stored = require(&mut conn, id).await.unwrap();
        assert_eq!(stored.status, ExchangeStatus::Cancelled);
        assert_eq!(stored.exchange_result, Some(ExchangeResult::Cancelled));
        assert_eq!(stored.cancelled_by, Some(f.exchanger));
        assert_eq!(stored.cancellation_reason.as_deref(), Some("changed mind"));

        let accepted = ExchangeStatus::Accepted;
        let late = decide(&mut conn, id, f.owner, f.selected, accepted, Utc::now()).await;
        assert!(!late.unwrap());
    }
}
