//! Reputation ledger: credit for completed exchanges, discredit for
//! cancelled ones, keyed by (user, exchange).

use crate::{
    model::{LedgerEntry, ReputationKind, ReputationReport},
    ExchangeId, Result, UserId,
};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

/// Award one credit point. Credit is unique per (user, exchange); a repeat
/// award accumulates onto the existing entry instead of adding a row.
pub async fn award_credit(
    conn: &mut SqliteConnection,
    user_id: UserId,
    exchange_id: ExchangeId,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO credits (user_id, exchange_id, points, created_at)
        VALUES (?, ?, 1, ?)
        ON CONFLICT (user_id, exchange_id) DO UPDATE SET points = points + 1
        "#,
    )
    .bind(user_id)
    .bind(exchange_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    tracing::info!(user_id, exchange_id, "Credit awarded");
    Ok(())
}

/// Append one discredit point. Discredits are not deduplicated; the engine
/// records them only on the transition into the terminal cancelled state.
pub async fn record_discredit(
    conn: &mut SqliteConnection,
    user_id: UserId,
    exchange_id: ExchangeId,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO discredits (user_id, exchange_id, points, reason, created_at)
        VALUES (?, ?, 1, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(exchange_id)
    .bind(reason)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    tracing::info!(user_id, exchange_id, reason, "Discredit recorded");
    Ok(())
}

pub async fn credit_summary(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.user_id, c.exchange_id, c.points, NULL AS reason, c.created_at,
               e.owner_id, e.exchanger_id, e.offered_item_id, e.selected_item_id,
               oi.item_name AS offered_item_name, si.item_name AS selected_item_name
        FROM credits c
        JOIN exchanges e ON e.id = c.exchange_id
        LEFT JOIN items oi ON oi.id = e.offered_item_id
        LEFT JOIN items si ON si.id = e.selected_item_id
        WHERE c.user_id = ?
        ORDER BY c.created_at DESC, c.id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(|row| entry_from_row(row, ReputationKind::Credit)).collect()
}

pub async fn discredit_summary(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.user_id, d.exchange_id, d.points, d.reason, d.created_at,
               e.owner_id, e.exchanger_id, e.offered_item_id, e.selected_item_id,
               oi.item_name AS offered_item_name, si.item_name AS selected_item_name
        FROM discredits d
        JOIN exchanges e ON e.id = d.exchange_id
        LEFT JOIN items oi ON oi.id = e.offered_item_id
        LEFT JOIN items si ON si.id = e.selected_item_id
        WHERE d.user_id = ?
        ORDER BY d.created_at DESC, d.id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(|row| entry_from_row(row, ReputationKind::Discredit)).collect()
}

/// Totals plus the entries backing them.
pub async fn report(conn: &mut SqliteConnection, user_id: UserId) -> Result<ReputationReport> {
    let credits = credit_summary(conn, user_id).await?;
    let discredits = discredit_summary(conn, user_id).await?;

    Ok(ReputationReport {
        user_id,
        credit_points: credits.iter().map(|entry| entry.points).sum(),
        discredit_points: discredits.iter().map(|entry| entry.points).sum(),
        credits,
        discredits,
    })
}

fn entry_from_row(row: &SqliteRow, kind: ReputationKind) -> Result<LedgerEntry> {
    let user_id: UserId = row.try_get("user_id")?;
    let owner_id: UserId = row.try_get("owner_id")?;
    let exchanger_id: UserId = row.try_get("exchanger_id")?;

    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id,
        exchange_id: row.try_get("exchange_id")?,
        kind,
        points: row.try_get("points")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
        counterparty_id: if user_id == owner_id { exchanger_id } else { owner_id },
        offered_item_id: row.try_get("offered_item_id")?,
        offered_item_name: row.try_get("offered_item_name")?,
        selected_item_id: row.try_get("selected_item_id")?,
        selected_item_name: row.try_get("selected_item_name")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, NewItem};
    use crate::database::testing::temp_database;
    use crate::{directory, store};

    async fn exchange(conn: &mut SqliteConnection) -> (UserId, UserId, ExchangeId) {
        let exchanger = directory::create_user(conn, "exchanger", "x@example.com").await.unwrap();
        let owner = directory::create_user(conn, "owner", "o@example.com").await.unwrap();
        let offered = catalog::create_item(
            conn,
            &NewItem {
                owner_id: owner.id,
                name: "drill".into(),
                item_type: String::new(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
        let selected = catalog::create_item(
            conn,
            &NewItem {
                owner_id: exchanger.id,
                name: "tent".into(),
                item_type: String::new(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
        let created = store::create(conn, exchanger.id, owner.id, offered.id, selected.id)
            .await
            .unwrap();
        (exchanger.id, owner.id, created.id)
    }

    #[tokio::test]
    async fn test_credit_accumulates_on_single_entry() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let (exchanger, owner, exchange_id) = exchange(&mut conn).await;

        award_credit(&mut conn, exchanger, exchange_id).await.unwrap();
        award_credit(&mut conn, exchanger, exchange_id).await.unwrap();

        let credits = credit_summary(&mut conn, exchanger).await.unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].points, 2);
        assert_eq!(credits[0].counterparty_id, owner);
        assert_eq!(credits[0].offered_item_name.as_deref(), Some("drill"));
        assert_eq!(credits[0].selected_item_name.as_deref(), Some("tent"));
    }

    #[tokio::test]
    async fn test_discredits_are_appended() {
        let (db, _dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let (exchanger, owner, exchange_id) = exchange(&mut conn).await;

        record_discredit(&mut conn, owner, exchange_id, "no show").await.unwrap();
        record_discredit(&mut conn, owner, exchange_id, "no show again").await.unwrap();
        award_credit(&mut conn, owner, exchange_id).await.unwrap();

        let report = report(&mut conn, owner).await.unwrap();
        assert_eq!(report.discredits.len(), 2);
        assert_eq!(report.discredit_points, 2);
        assert_eq!(report.credit_points, 1);
        assert_eq!(report.net_points(), -1);
        assert_eq!(report.discredits[0].counterparty_id, exchanger);
        assert!(report.discredits.iter().all(|entry| entry.reason.is_some()));

        assert!(credit_summary(&mut conn, exchanger).await.unwrap().is_empty());
    }
}
