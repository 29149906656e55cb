//! Audit log models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of audited actions matching the `audit_action` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "audit_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AccountLocked,
    AccountUnlocked,
    RoleChanged,
    SubscriptionGranted,
    SubscriptionActivated,
    SubscriptionCancelled,
    SubscriptionExpired,
    PaymentFailed,
    CreditsReset,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AccountLocked => "account_locked",
            AuditAction::AccountUnlocked => "account_unlocked",
            AuditAction::RoleChanged => "role_changed",
            AuditAction::SubscriptionGranted => "subscription_granted",
            AuditAction::SubscriptionActivated => "subscription_activated",
            AuditAction::SubscriptionCancelled => "subscription_cancelled",
            AuditAction::SubscriptionExpired => "subscription_expired",
            AuditAction::PaymentFailed => "payment_failed",
            AuditAction::CreditsReset => "credits_reset",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: AuditAction,
    /// Acting user id, or `None` for the system.
    pub actor_user_id: Option<String>,
    pub target_user_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
