//! # shelf_core
//!
//! Entitlement engine for Shelf: who may download what, and what it costs.
//!
//! Subscriptions grant unlimited downloads; everyone else draws on a
//! periodically refilled credit allowance, subject to a short-window rate
//! limit. Payment gateway webhooks drive subscription state. All state lives
//! behind [`store::LedgerStore`] and is mutated only by version-conditioned
//! writes.

pub mod accounts;
pub mod admin;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod store;
pub mod subscriptions;
pub mod sweep;
pub mod uuid;
pub mod webhook;

pub use accounts::SubscriptionSummary;
pub use config::EntitlementConfig;
pub use engine::Entitlements;
pub use error::{EntitlementError, Result};
pub use gate::{Decision, DenialReason};
pub use sweep::SweepReport;
pub use webhook::WebhookOutcome;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
