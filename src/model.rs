use crate::{ExchangeError, ExchangeId, ItemId, NotificationId, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub owner_id: UserId,
    pub name: String,
    pub item_type: String,
    pub description: String,
    pub is_locked: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Whether the item may be referenced by a new proposal.
    pub fn is_available(&self) -> bool {
        !self.is_locked && !self.is_deleted
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Accepted => "accepted",
            ExchangeStatus::Rejected => "rejected",
            ExchangeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeStatus {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExchangeStatus::Pending),
            "accepted" => Ok(ExchangeStatus::Accepted),
            "rejected" => Ok(ExchangeStatus::Rejected),
            "cancelled" => Ok(ExchangeStatus::Cancelled),
            other => Err(ExchangeError::Corrupt(format!("Invalid exchange status: {}", other))),
        }
    }
}

/// Terminal settlement of an exchange, separate from its status because an
/// accepted exchange is not settled until both parties confirm or one cancels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeResult {
    Completed,
    Cancelled,
}

impl ExchangeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeResult::Completed => "completed",
            ExchangeResult::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ExchangeResult {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(ExchangeResult::Completed),
            "cancelled" => Ok(ExchangeResult::Cancelled),
            other => Err(ExchangeError::Corrupt(format!("Invalid exchange result: {}", other))),
        }
    }
}

/// The two sides of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// Owns the offered (requested) item and decides on the proposal.
    Owner,
    /// Proposed the exchange and offers the selected item in return.
    Exchanger,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeProposal {
    pub id: ExchangeId,
    pub exchanger_id: UserId,
    pub owner_id: UserId,
    pub offered_item_id: ItemId,
    pub selected_item_id: ItemId,
    pub status: ExchangeStatus,
    pub exchange_result: Option<ExchangeResult>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub owner_confirmed_at: Option<DateTime<Utc>>,
    pub exchanger_confirmed_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl ExchangeProposal {
    pub fn party_of(&self, user_id: UserId) -> Option<Party> {
        if user_id == self.owner_id {
            Some(Party::Owner)
        } else if user_id == self.exchanger_id {
            Some(Party::Exchanger)
        } else {
            None
        }
    }

    pub fn counterparty(&self, party: Party) -> UserId {
        match party {
            Party::Owner => self.exchanger_id,
            Party::Exchanger => self.owner_id,
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.owner_confirmed_at.is_some() && self.exchanger_confirmed_at.is_some()
    }

    pub fn items(&self) -> [ItemId; 2] {
        [self.offered_item_id, self.selected_item_id]
    }
}

/// Raw propose request as received from a client. Ids may arrive as JSON
/// numbers or numeric strings; anything else is rejected by [`validate`].
///
/// [`validate`]: ProposeRequest::validate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub offered_item_id: Option<serde_json::Value>,
    pub proposer_id: Option<serde_json::Value>,
    pub selected_item_id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub offered_item_id: ItemId,
    pub proposer_id: UserId,
    pub selected_item_id: ItemId,
}

impl ProposeRequest {
    pub fn new(offered_item_id: ItemId, proposer_id: UserId, selected_item_id: ItemId) -> Self {
        Self {
            offered_item_id: Some(offered_item_id.into()),
            proposer_id: Some(proposer_id.into()),
            selected_item_id: Some(selected_item_id.into()),
        }
    }

    pub fn validate(&self) -> Result<Proposal> {
        let proposal = Proposal {
            offered_item_id: parse_id("offered_item_id", self.offered_item_id.as_ref())?,
            proposer_id: parse_id("proposer_id", self.proposer_id.as_ref())?,
            selected_item_id: parse_id("selected_item_id", self.selected_item_id.as_ref())?,
        };

        if proposal.offered_item_id == proposal.selected_item_id {
            return Err(ExchangeError::InvalidInput(
                "offered_item_id and selected_item_id must differ".to_string(),
            ));
        }

        Ok(proposal)
    }
}

fn parse_id(field: &str, value: Option<&serde_json::Value>) -> Result<i64> {
    let id = match value {
        None | Some(serde_json::Value::Null) => {
            return Err(ExchangeError::InvalidInput(format!("{} is required", field)));
        }
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };

    match id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(ExchangeError::InvalidInput(format!("{} must be a positive integer", field))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    /// This side is confirmed; waiting on the other party.
    Pending,
    /// Both sides confirmed and the exchange is settled.
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReputationKind {
    Credit,
    Discredit,
}

/// A ledger row joined with the exchange and item context it refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub exchange_id: ExchangeId,
    pub kind: ReputationKind,
    pub points: i64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub counterparty_id: UserId,
    pub offered_item_id: ItemId,
    pub offered_item_name: Option<String>,
    pub selected_item_id: ItemId,
    pub selected_item_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReputationReport {
    pub user_id: UserId,
    pub credit_points: i64,
    pub discredit_points: i64,
    pub credits: Vec<LedgerEntry>,
    pub discredits: Vec<LedgerEntry>,
}

impl ReputationReport {
    pub fn net_points(&self) -> i64 {
        self.credit_points - self.discredit_points
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub message: String,
    pub exchange_id: Option<ExchangeId>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub id: i64,
    pub user_id: UserId,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
