//! # Barter Exchange
//!
//! Item-for-item exchange engine for a barter marketplace.
//!
//! ## Architecture
//!
//! - **Engine**: proposal, acceptance, rejection, two-party receipt confirmation and cancellation
//! - **Item Locks**: at most one accepted exchange holds an item
//! - **Exchange Store**: one durable row per proposal, guarded conditional updates
//! - **Reputation**: credit for completed exchanges, discredit for cancelled ones
//! - **Notifications**: stored rows plus best-effort live push to connected users
//! - **Collaborators**: user directory, item catalog and activity log backing the engine
//! - **API**: Axum HTTP surface with Server-Sent Events for live notifications

pub mod activity;
pub mod api;
pub mod catalog;
pub mod config;
pub mod database;
pub mod directory;
pub mod engine;
pub mod error;
pub mod locks;
pub mod model;
pub mod notify;
pub mod reputation;
pub mod store;

pub use config::AppConfig;
pub use database::Database;
pub use engine::ExchangeEngine;
pub use error::{ExchangeError, Result};
pub use model::{
    ConfirmOutcome, ExchangeProposal, ExchangeResult, ExchangeStatus, Item, LedgerEntry,
    Notification, ProposeRequest, ReputationReport, User,
};
pub use notify::{NotificationDispatcher, Publisher, SubscriberHub};

pub type UserId = i64;
pub type ItemId = i64;
pub type ExchangeId = i64;
pub type NotificationId = i64;
