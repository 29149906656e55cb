//! Ledger storage.
//!
//! [`LedgerStore`] is the only way the engine touches persistent state. Every
//! mutable record carries a `version`; `update_*` methods are conditioned
//! writes that apply only if the stored version still equals the version on
//! the record passed in, and bump it by one. Callers re-read and retry on
//! [`Cas::Conflict`].
//!
//! Two implementations ship: [`postgres::PgLedgerStore`] for production and
//! [`memory::MemoryStore`] for tests and single-process embedding.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AuditAction, AuditLogEntry, CreditBalance, DownloadRecord, DownloadWindow, PaymentEvent,
    Subscription, UserAccount,
};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cas {
    Applied,
    /// The record changed since it was read, or the write would break a
    /// uniqueness invariant (e.g. a second `active` subscription).
    Conflict,
}

impl Cas {
    pub fn applied(self) -> bool {
        self == Cas::Applied
    }
}

/// Outcome of an insert keyed on a unique attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted<T> {
    Created(T),
    /// A record with the same key already exists; it is returned unchanged.
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn into_inner(self) -> T {
        match self {
            Inserted::Created(v) | Inserted::Existing(v) => v,
        }
    }
}

/// Data-access layer for the entitlement engine.
///
/// Implementations must be `Send + Sync`; they are shared across every
/// request handler and the sweep task.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // -- users ---------------------------------------------------------------

    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>>;

    /// Insert `user` unless a record with the same id exists.
    async fn insert_user(&self, user: &UserAccount) -> StoreResult<Inserted<UserAccount>>;

    async fn update_user(&self, user: &UserAccount) -> StoreResult<Cas>;

    /// Users whose mirror still says `active` but whose paid period ended at
    /// or before `now`.
    async fn users_with_lapsed_mirror(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UserAccount>>;

    // -- subscriptions -------------------------------------------------------

    /// Insert unless a subscription with the same external reference exists.
    async fn insert_subscription(&self, sub: &Subscription)
    -> StoreResult<Inserted<Subscription>>;

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>>;

    async fn find_subscription_by_reference(
        &self,
        reference: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// Subscriptions for a user in `active` or `cancelled` status.
    async fn live_subscriptions(&self, user_id: &str) -> StoreResult<Vec<Subscription>>;

    /// `active` subscriptions whose period ended at or before `now`.
    async fn active_subscriptions_expiring(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>>;

    /// Conditioned write. Returns [`Cas::Conflict`] when the version moved or
    /// when the user already has a different `active` subscription.
    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<Cas>;

    // -- credits -------------------------------------------------------------

    async fn get_balance(&self, user_id: &str) -> StoreResult<Option<CreditBalance>>;

    async fn insert_balance(&self, balance: &CreditBalance)
    -> StoreResult<Inserted<CreditBalance>>;

    async fn update_balance(&self, balance: &CreditBalance) -> StoreResult<Cas>;

    /// Balances with `resets_at <= now`.
    async fn balances_due(&self, now: DateTime<Utc>, limit: i64)
    -> StoreResult<Vec<CreditBalance>>;

    // -- downloads -----------------------------------------------------------

    async fn get_download_window(&self, user_id: &str) -> StoreResult<Option<DownloadWindow>>;

    async fn insert_download_window(
        &self,
        window: &DownloadWindow,
    ) -> StoreResult<Inserted<DownloadWindow>>;

    async fn update_download_window(&self, window: &DownloadWindow) -> StoreResult<Cas>;

    async fn append_download(&self, record: &DownloadRecord) -> StoreResult<()>;

    // -- payment idempotency -------------------------------------------------

    async fn get_payment_event(&self, reference: &str) -> StoreResult<Option<PaymentEvent>>;

    /// Insert or overwrite the idempotency record for `event.reference`.
    async fn put_payment_event(&self, event: &PaymentEvent) -> StoreResult<()>;

    // -- audit ---------------------------------------------------------------

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()>;

    /// Whether an entry of `action` exists whose details name `subscription_id`.
    async fn audit_recorded(&self, action: AuditAction, subscription_id: Uuid)
    -> StoreResult<bool>;
}
