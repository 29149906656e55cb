//! Entitlement domain models.
//!
//! Row structs double as domain types; Postgres enums are mapped with
//! `sqlx::Type` so the memory and Postgres stores share one vocabulary.

pub mod account;
pub mod audit;
pub mod ledger;
pub mod payment;
pub mod subscription;

pub use account::{Actor, Role, SubscriptionMirror, UserAccount};
pub use audit::{AuditAction, AuditLogEntry};
pub use ledger::{BalanceView, CreditBalance, DownloadRecord, DownloadWindow};
pub use payment::{GatewayStatus, PaymentEvent, WebhookEnvelope, WebhookPayment};
pub use subscription::{Subscription, SubscriptionStatus};
