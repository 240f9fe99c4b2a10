//! Exchange workflow engine.
//!
//! Lifecycle of a proposal:
//!
//! ```text
//! pending ──accept──▶ accepted ──both confirm──▶ (result = completed)
//!    │                    └──────cancel────────▶ (result = cancelled)
//!    ├──reject──▶ rejected
//!    └──cancel / superseded──▶ cancelled
//! ```
//!
//! Each transition is one database transaction that opens with the guarded
//! write on the exchange row (see [`crate::database`]). Lock acquisition,
//! cascade cancellation, ledger entries, notification rows and activity
//! entries commit together with it or not at all. Live pushes go out only
//! after commit.

use crate::{
    activity, catalog, directory, locks,
    model::{
        ConfirmOutcome, ExchangeProposal, ExchangeResult, ExchangeStatus, LedgerEntry, Notification,
        Party, Proposal, ProposeRequest, ReputationReport,
    },
    notify::{NotificationDispatcher, Publisher},
    reputation, store, Database, ExchangeError, ExchangeId, ItemId, Result, UserId,
};
use chrono::Utc;
use serde_json::json;
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{info, warn};

const SUPERSEDED_NOTICE: &str =
    "Your exchange request was cancelled because the item was exchanged with someone else.";

pub struct ExchangeEngine {
    db: Database,
    dispatcher: NotificationDispatcher,
}

impl ExchangeEngine {
    pub fn new(db: Database, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            db,
            dispatcher: NotificationDispatcher::new(publisher),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create a pending proposal asking the owner of `offered_item_id` to
    /// swap it for the proposer's `selected_item_id`. Items are not locked
    /// yet, so several proposals may compete for the same item.
    #[tracing::instrument(skip(self, request))]
    pub async fn propose(&self, request: &ProposeRequest) -> Result<ExchangeId> {
        let Proposal {
            offered_item_id,
            proposer_id,
            selected_item_id,
        } = request.validate()?;

        let (owner_id, proposer_name) = {
            let mut conn = self.db.pool().acquire().await?;

            let offered = catalog::get_item(&mut conn, offered_item_id)
                .await?
                .ok_or_else(|| ExchangeError::NotFound(format!("Item {}", offered_item_id)))?;
            let selected = catalog::get_item(&mut conn, selected_item_id)
                .await?
                .ok_or_else(|| {
                    ExchangeError::InvalidReference(format!("Item {}", selected_item_id))
                })?;

            for item in [&offered, &selected] {
                if !item.is_available() {
                    return Err(ExchangeError::ItemUnavailable(format!(
                        "Item {} is locked or deleted",
                        item.id
                    )));
                }
            }

            let proposer = directory::get_user(&mut conn, proposer_id)
                .await?
                .ok_or_else(|| ExchangeError::NotFound(format!("User {}", proposer_id)))?;
            if proposer.is_banned {
                return Err(ExchangeError::Unauthorized(format!("User {} is banned", proposer_id)));
            }
            if selected.owner_id != proposer_id {
                return Err(ExchangeError::InvalidInput(format!(
                    "Item {} does not belong to user {}",
                    selected_item_id, proposer_id
                )));
            }
            if offered.owner_id == proposer_id {
                return Err(ExchangeError::InvalidInput(
                    "Cannot propose an exchange for your own item".to_string(),
                ));
            }

            (offered.owner_id, proposer.username)
        };

        let mut tx = self.db.begin().await?;
        let exchange = store::create(
            &mut tx,
            proposer_id,
            owner_id,
            offered_item_id,
            selected_item_id,
        )
        .await?;
        let notice = self
            .dispatcher
            .record(
                &mut tx,
                owner_id,
                &format!("{} wants to exchange items with you.", proposer_name),
                Some(exchange.id),
            )
            .await?;
        activity::log(
            &mut tx,
            proposer_id,
            "exchange.proposed",
            &json!({
                "exchange_id": exchange.id,
                "owner_id": owner_id,
                "offered_item_id": offered_item_id,
                "selected_item_id": selected_item_id,
            }),
        )
        .await?;
        tx.commit().await?;

        self.dispatcher.publish_all(&[notice]);
        info!(exchange_id = exchange.id, proposer_id, owner_id, "Exchange proposed");
        Ok(exchange.id)
    }

    /// Owner accepts. Both items are locked, and every other pending
    /// proposal offering the same selected item is cancelled. If either lock
    /// is already held the whole acceptance fails with `ItemUnavailable`.
    #[tracing::instrument(skip(self))]
    pub async fn accept(
        &self,
        exchange_id: ExchangeId,
        owner_id: UserId,
        selected_item_id: ItemId,
    ) -> Result<ExchangeProposal> {
        let mut tx = self.db.begin().await?;

        let decided = store::decide(
            &mut tx,
            exchange_id,
            owner_id,
            selected_item_id,
            ExchangeStatus::Accepted,
            Utc::now(),
        )
        .await?;
        if !decided {
            let err = decision_error(
                &mut tx,
                exchange_id,
                owner_id,
                selected_item_id,
                ExchangeStatus::Accepted,
            )
            .await?;
            warn!(exchange_id, error = %err, "Acceptance refused");
            return Err(err);
        }

        if directory::is_banned(&mut tx, owner_id).await? {
            return Err(ExchangeError::Unauthorized(format!("User {} is banned", owner_id)));
        }

        let exchange = store::require(&mut tx, exchange_id).await?;
        for item_id in exchange.items() {
            if !locks::try_lock(&mut tx, item_id).await? {
                warn!(exchange_id, item_id, "Item already committed; acceptance rolled back");
                return Err(ExchangeError::ItemUnavailable(format!(
                    "Item {} is already committed to another exchange",
                    item_id
                )));
            }
        }

        let superseded = store::cancel_competing(&mut tx, &exchange).await?;

        let mut notices = Vec::with_capacity(superseded.len() + 1);
        notices.push(
            self.dispatcher
                .record(
                    &mut tx,
                    exchange.exchanger_id,
                    "Your exchange request was accepted.",
                    Some(exchange.id),
                )
                .await?,
        );
        for other in &superseded {
            notices.push(
                self.dispatcher
                    .record(
                        &mut tx,
                        other.exchanger_id,
                        SUPERSEDED_NOTICE,
                        Some(other.id),
                    )
                    .await?,
            );
        }

        let superseded_ids: Vec<ExchangeId> = superseded.iter().map(|other| other.id).collect();
        activity::log(
            &mut tx,
            owner_id,
            "exchange.accepted",
            &json!({ "exchange_id": exchange.id, "superseded": superseded_ids }),
        )
        .await?;
        tx.commit().await?;

        self.dispatcher.publish_all(&notices);
        info!(exchange_id, superseded = superseded_ids.len(), "Exchange accepted");
        Ok(exchange)
    }

    /// Owner declines a pending proposal. No locks are involved.
    #[tracing::instrument(skip(self))]
    pub async fn reject(
        &self,
        exchange_id: ExchangeId,
        owner_id: UserId,
        selected_item_id: ItemId,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let decided = store::decide(
            &mut tx,
            exchange_id,
            owner_id,
            selected_item_id,
            ExchangeStatus::Rejected,
            Utc::now(),
        )
        .await?;
        if !decided {
            let err = decision_error(
                &mut tx,
                exchange_id,
                owner_id,
                selected_item_id,
                ExchangeStatus::Rejected,
            )
            .await?;
            warn!(exchange_id, error = %err, "Rejection refused");
            return Err(err);
        }

        let exchange = store::require(&mut tx, exchange_id).await?;
        let notice = self
            .dispatcher
            .record(
                &mut tx,
                exchange.exchanger_id,
                "Your exchange request was rejected.",
                Some(exchange.id),
            )
            .await?;
        let details = json!({ "exchange_id": exchange.id });
        activity::log(&mut tx, owner_id, "exchange.rejected", &details).await?;
        tx.commit().await?;

        self.dispatcher.publish_all(&[notice]);
        info!(exchange_id, "Exchange rejected");
        Ok(())
    }

    /// One party reports that the physical swap happened. The exchange
    /// completes, and both parties earn a credit, once both sides confirm.
    /// Repeating a confirmation changes nothing.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_receipt(
        &self,
        exchange_id: ExchangeId,
        user_id: UserId,
    ) -> Result<ConfirmOutcome> {
        let mut tx = self.db.begin().await?;
        let now = Utc::now();

        let stamped =
            store::set_confirmation(&mut tx, exchange_id, Party::Owner, user_id, now).await?
                || store::set_confirmation(&mut tx, exchange_id, Party::Exchanger, user_id, now)
                    .await?;

        let exchange = store::require(&mut tx, exchange_id).await?;
        let party = exchange
            .party_of(user_id)
            .ok_or_else(|| not_a_party(user_id, exchange_id))?;

        match exchange.exchange_result {
            Some(ExchangeResult::Completed) => return Ok(ConfirmOutcome::Completed),
            Some(ExchangeResult::Cancelled) => {
                return Err(ExchangeError::InvalidState(format!(
                    "Exchange {} was cancelled",
                    exchange_id
                )));
            }
            None => {}
        }
        if exchange.status != ExchangeStatus::Accepted {
            return Err(ExchangeError::InvalidState(format!(
                "Exchange {} is {}; only accepted exchanges can be confirmed",
                exchange_id, exchange.status
            )));
        }
        if !stamped {
            // This side had already confirmed.
            return Ok(ConfirmOutcome::Pending);
        }

        let counterparty = exchange.counterparty(party);
        let (outcome, message, action) = if exchange.both_confirmed() {
            if !store::set_result(&mut tx, exchange_id, ExchangeResult::Completed).await? {
                return Err(ExchangeError::InvalidState(format!(
                    "Exchange {} is already settled",
                    exchange_id
                )));
            }
            reputation::award_credit(&mut tx, exchange.owner_id, exchange_id).await?;
            reputation::award_credit(&mut tx, exchange.exchanger_id, exchange_id).await?;
            (
                ConfirmOutcome::Completed,
                "Both parties confirmed receipt. The exchange is complete.",
                "exchange.completed",
            )
        } else {
            (
                ConfirmOutcome::Pending,
                "The other party confirmed receipt. Please confirm to complete the exchange.",
                "exchange.confirmed",
            )
        };

        let notice = self
            .dispatcher
            .record(&mut tx, counterparty, message, Some(exchange_id))
            .await?;
        let details = json!({ "exchange_id": exchange_id, "party": party });
        activity::log(&mut tx, user_id, action, &details).await?;
        tx.commit().await?;

        self.dispatcher.publish_all(&[notice]);
        info!(exchange_id, user_id, outcome = ?outcome, "Receipt confirmed");
        Ok(outcome)
    }

    /// Either party abandons an unsettled exchange. Locks held by an
    /// accepted exchange are released and both parties receive a discredit,
    /// whoever initiated the cancellation.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        exchange_id: ExchangeId,
        user_id: UserId,
        reason: &str,
    ) -> Result<()> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ExchangeError::InvalidInput(
                "a cancellation reason is required".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;

        if !store::set_cancellation(&mut tx, exchange_id, user_id, reason).await? {
            let err = match store::get(&mut tx, exchange_id).await? {
                None => ExchangeError::NotFound(format!("Exchange {}", exchange_id)),
                Some(exchange) if exchange.party_of(user_id).is_none() => {
                    not_a_party(user_id, exchange_id)
                }
                Some(exchange) => ExchangeError::InvalidState(format!(
                    "Exchange {} is {} and can no longer be cancelled",
                    exchange_id,
                    describe(&exchange)
                )),
            };
            warn!(exchange_id, error = %err, "Cancellation refused");
            return Err(err);
        }

        let exchange = store::require(&mut tx, exchange_id).await?;
        if exchange.status == ExchangeStatus::Accepted {
            for item_id in exchange.items() {
                locks::unlock(&mut tx, item_id).await?;
            }
        }

        for party_id in [exchange.owner_id, exchange.exchanger_id] {
            reputation::record_discredit(&mut tx, party_id, exchange_id, reason).await?;
        }

        let counterparty = if user_id == exchange.owner_id {
            exchange.exchanger_id
        } else {
            exchange.owner_id
        };
        let notice = self
            .dispatcher
            .record(
                &mut tx,
                counterparty,
                &format!("Your exchange was cancelled by the other party: {}", reason),
                Some(exchange_id),
            )
            .await?;
        activity::log(
            &mut tx,
            user_id,
            "exchange.cancelled",
            &json!({ "exchange_id": exchange_id, "reason": reason }),
        )
        .await?;
        tx.commit().await?;

        self.dispatcher.publish_all(&[notice]);
        info!(exchange_id, user_id, "Exchange cancelled");
        Ok(())
    }

    /// Admin ban toggle. The user is told either way; a banned user can no
    /// longer propose or accept.
    #[tracing::instrument(skip(self))]
    pub async fn set_banned(&self, user_id: UserId, banned: bool) -> Result<()> {
        {
            let mut conn = self.db.pool().acquire().await?;
            directory::set_banned(&mut conn, user_id, banned).await?;
        }

        let message = if banned {
            "Your account has been suspended from exchanging items."
        } else {
            "Your account has been reinstated."
        };
        self.dispatcher
            .notify(self.db.pool(), user_id, message, None)
            .await?;
        Ok(())
    }

    pub async fn get_status(&self, exchange_id: ExchangeId) -> Result<ExchangeProposal> {
        let mut conn = self.db.pool().acquire().await?;
        store::require(&mut conn, exchange_id).await
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ExchangeProposal>> {
        let mut conn = self.db.pool().acquire().await?;
        store::list_for_user(&mut conn, user_id).await
    }

    pub async fn credit_summary(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        let mut conn = self.db.pool().acquire().await?;
        reputation::credit_summary(&mut conn, user_id).await
    }

    pub async fn discredit_summary(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        let mut conn = self.db.pool().acquire().await?;
        reputation::discredit_summary(&mut conn, user_id).await
    }

    pub async fn reputation(&self, user_id: UserId) -> Result<ReputationReport> {
        let mut conn = self.db.pool().acquire().await?;
        reputation::report(&mut conn, user_id).await
    }

    pub async fn notifications(&self, user_id: UserId) -> Result<Vec<Notification>> {
        let mut conn = self.db.pool().acquire().await?;
        crate::notify::list_for_user(&mut conn, user_id).await
    }
}

/// Explain why an owner decision matched no row.
async fn decision_error(
    conn: &mut SqliteConnection,
    exchange_id: ExchangeId,
    owner_id: UserId,
    selected_item_id: ItemId,
    decision: ExchangeStatus,
) -> Result<ExchangeError> {
    let Some(exchange) = store::get(conn, exchange_id).await? else {
        return Ok(ExchangeError::NotFound(format!("Exchange {}", exchange_id)));
    };

    let err = if exchange.owner_id != owner_id {
        ExchangeError::Mismatch(format!("User {} does not own exchange {}", owner_id, exchange_id))
    } else if exchange.selected_item_id != selected_item_id {
        ExchangeError::Mismatch(format!(
            "Item {} is not the item offered in exchange {}",
            selected_item_id, exchange_id
        ))
    } else if decision == ExchangeStatus::Accepted
        && exchange.status == ExchangeStatus::Cancelled
        && exchange.cancelled_by.is_none()
    {
        ExchangeError::ItemUnavailable(format!(
            "Exchange {} was superseded: {}",
            exchange_id,
            exchange.cancellation_reason.as_deref().unwrap_or(store::SUPERSEDED_REASON)
        ))
    } else {
        ExchangeError::InvalidState(format!(
            "Exchange {} is already {}",
            exchange_id,
            describe(&exchange)
        ))
    };

    Ok(err)
}

fn not_a_party(user_id: UserId, exchange_id: ExchangeId) -> ExchangeError {
    ExchangeError::Unauthorized(format!(
        "User {} is not a party to exchange {}",
        user_id, exchange_id
    ))
}

fn describe(exchange: &ExchangeProposal) -> &'static str {
    match exchange.exchange_result {
        Some(result) => result.as_str(),
        None => exchange.status.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewItem;
    use crate::database::testing::temp_database;
    use crate::notify::MockPublisher;
    use tempfile::TempDir;

    struct Market {
        engine: ExchangeEngine,
        owner: UserId,
        exchanger: UserId,
        offered: ItemId,
        selected: ItemId,
        _dir: TempDir,
    }

    impl Market {
        async fn propose(&self) -> ExchangeId {
            self.engine
                .propose(&ProposeRequest::new(self.offered, self.exchanger, self.selected))
                .await
                .unwrap()
        }

        async fn is_locked(&self, item_id: ItemId) -> bool {
            let mut conn = self.engine.database().pool().acquire().await.unwrap();
            locks::is_locked(&mut conn, item_id).await.unwrap()
        }
    }

    fn new_item(owner_id: UserId, name: &str) -> NewItem {
        NewItem {
            owner_id,
            name: name.to_string(),
            item_type: "furniture".to_string(),
            description: String::new(),
        }
    }

    async fn market(publisher: MockPublisher) -> Market {
        let (db, dir) = temp_database().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let owner = directory::create_user(&mut conn, "owner", "owner@example.com")
            .await
            .unwrap();
        let exchanger = directory::create_user(&mut conn, "exchanger", "exchanger@example.com")
            .await
            .unwrap();
        let offered = catalog::create_item(&mut conn, &new_item(owner.id, "sofa"))
            .await
            .unwrap();
        let selected = catalog::create_item(&mut conn, &new_item(exchanger.id, "desk"))
            .await
            .unwrap();
        drop(conn);

        Market {
            engine: ExchangeEngine::new(db, Arc::new(publisher)),
            owner: owner.id,
            exchanger: exchanger.id,
            offered: offered.id,
            selected: selected.id,
            _dir: dir,
        }
    }

    fn quiet_publisher() -> MockPublisher {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().return_const(false);
        publisher
    }

    #[tokio::test]
    async fn test_propose_notifies_owner_after_commit() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|n| n.message == "exchanger wants to exchange items with you.")
            .times(1)
            .return_const(true);
        let m = market(publisher).await;

        let id = m.propose().await;

        let notices = m.engine.notifications(m.owner).await.unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].exchange_id, Some(id));
    }

    #[tokio::test]
    async fn test_propose_validation_failures() {
        let m = market(quiet_publisher()).await;

        let err = m.engine.propose(&ProposeRequest::default()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidInput(_)));

        let missing_offered = ProposeRequest::new(999, m.exchanger, m.selected);
        let err = m.engine.propose(&missing_offered).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));

        // The selected item must be the proposer's own.
        let reversed = ProposeRequest::new(m.selected, m.owner, m.offered);
        assert!(m.engine.propose(&reversed).await.is_ok());
        let not_owned = ProposeRequest::new(m.offered, m.owner, m.selected);
        let err = m.engine.propose(&not_owned).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_banned_proposer_is_unauthorized() {
        let m = market(quiet_publisher()).await;
        {
            let mut conn = m.engine.database().pool().acquire().await.unwrap();
            directory::set_banned(&mut conn, m.exchanger, true).await.unwrap();
        }

        let request = ProposeRequest::new(m.offered, m.exchanger, m.selected);
        let err = m.engine.propose(&request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_accept_rejects_forged_requests() {
        let m = market(quiet_publisher()).await;
        let id = m.propose().await;

        let err = m.engine.accept(999, m.owner, m.selected).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
        let err = m.engine.accept(id, m.exchanger, m.selected).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Mismatch(_)));
        let err = m.engine.accept(id, m.owner, m.offered).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Mismatch(_)));

        let exchange = m.engine.get_status(id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Pending);
    }

    #[tokio::test]
    async fn test_banned_owner_accept_rolls_back() {
        let m = market(quiet_publisher()).await;
        let id = m.propose().await;
        {
            let mut conn = m.engine.database().pool().acquire().await.unwrap();
            directory::set_banned(&mut conn, m.owner, true).await.unwrap();
        }

        let err = m.engine.accept(id, m.owner, m.selected).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthorized(_)));

        let exchange = m.engine.get_status(id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Pending);
        assert_eq!(exchange.accepted_at, None);
        assert!(!m.is_locked(m.offered).await);
        assert!(!m.is_locked(m.selected).await);
    }

    #[tokio::test]
    async fn test_ban_toggle_notifies_user() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|n| n.message.contains("suspended") && n.exchange_id.is_none())
            .times(1)
            .return_const(false);
        let m = market(publisher).await;

        m.engine.set_banned(m.exchanger, true).await.unwrap();

        let notices = m.engine.notifications(m.exchanger).await.unwrap();
        assert_eq!(notices.len(), 1);
        let request = ProposeRequest::new(m.offered, m.exchanger, m.selected);
        let err = m.engine.propose(&request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthorized(_)));

        let err = m.engine.set_banned(4040, true).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let m = market(quiet_publisher()).await;
        let id = m.propose().await;

        m.engine.reject(id, m.owner, m.selected).await.unwrap();
        let exchange = m.engine.get_status(id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Rejected);

        let err = m.engine.accept(id, m.owner, m.selected).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidState(_)));
        let err = m.engine.confirm_receipt(id, m.owner).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidState(_)));
        let err = m.engine.cancel(id, m.owner, "oops").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidState(_)));

        assert!(!m.is_locked(m.offered).await);
    }

    #[tokio::test]
    async fn test_confirm_requires_party_and_acceptance() {
        let m = market(quiet_publisher()).await;
        let id = m.propose().await;

        let err = m.engine.confirm_receipt(id, m.owner).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidState(_)));

        m.engine.accept(id, m.owner, m.selected).await.unwrap();
        let err = m.engine.confirm_receipt(id, 4040).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthorized(_)));
        let err = m.engine.confirm_receipt(999, m.owner).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_of_pending_proposal_keeps_foreign_locks() {
        let m = market(quiet_publisher()).await;
        let (third, third_item) = {
            let mut conn = m.engine.database().pool().acquire().await.unwrap();
            let third = directory::create_user(&mut conn, "third", "third@example.com")
                .await
                .unwrap();
            let item = catalog::create_item(&mut conn, &new_item(third.id, "lamp"))
                .await
                .unwrap();
            (third.id, item.id)
        };

        // Two proposals for the owner's sofa with different selected items.
        let first = m.propose().await;
        let second = m
            .engine
            .propose(&ProposeRequest::new(m.offered, third, third_item))
            .await
            .unwrap();

        m.engine.accept(first, m.owner, m.selected).await.unwrap();
        m.engine.cancel(second, third, "found another sofa").await.unwrap();

        assert!(m.is_locked(m.offered).await);
        assert!(m.is_locked(m.selected).await);

        let cancelled = m.engine.get_status(second).await.unwrap();
        assert_eq!(cancelled.status, ExchangeStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(third));

        // One discredit per party of the cancelled proposal, none for bystanders.
        for (user, expected) in [(third, 1), (m.owner, 1), (m.exchanger, 0)] {
            let discredits = m.engine.discredit_summary(user).await.unwrap();
            assert_eq!(discredits.len(), expected, "user {}", user);
            assert!(discredits.iter().all(|entry| entry.exchange_id == second));
        }
    }

    #[tokio::test]
    async fn test_cancel_requires_reason_and_party() {
        let m = market(quiet_publisher()).await;
        let id = m.propose().await;

        let err = m.engine.cancel(id, m.owner, "  ").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidInput(_)));
        let err = m.engine.cancel(id, 777, "nope").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthorized(_)));
        let err = m.engine.cancel(999, m.owner, "nope").await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }
}
