//! Entitlement engine errors.

use thiserror::Error;

use crate::models::SubscriptionStatus;
use crate::store::StoreError;

/// Errors returned by engine operations.
///
/// `InsufficientCredits`, `RateLimited` and `AccountLocked` are expected
/// outcomes; the gate reports them inside a [`crate::gate::Decision`] rather
/// than as errors. They appear here for the lower-level ledger operations.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Account is locked")]
    AccountLocked,

    #[error("Invalid subscription transition: {from} -> {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Payment already recorded: {0}")]
    DuplicatePayment(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Download rate limit exceeded")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for EntitlementError {
    fn from(e: sqlx::Error) -> Self {
        EntitlementError::Store(StoreError::Db(e))
    }
}

pub type Result<T> = std::result::Result<T, EntitlementError>;
