//! Request and response bodies.
//!
//! Wire format is camelCase JSON, distinct from the core domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_core::models::{Role, Subscription, SubscriptionMirror, SubscriptionStatus, UserAccount};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub resource_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    /// Falls back to the token's email claim.
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequest {
    /// Defaults to the configured subscription length.
    #[serde(default)]
    pub duration_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRequest {
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub user_id: String,
    pub role: Role,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub subscription_status: SubscriptionMirror,
    pub next_billing_at: Option<DateTime<Utc>>,
}

impl From<UserAccount> for UserView {
    fn from(u: UserAccount) -> Self {
        Self {
            user_id: u.user_id,
            role: u.role,
            is_locked: u.is_locked,
            lock_reason: u.lock_reason,
            subscription_status: u.subscription_status,
            next_billing_at: u.next_billing_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: Uuid,
    pub user_id: String,
    pub reference: String,
    pub status: SubscriptionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Subscription> for SubscriptionView {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            reference: s.external_reference,
            status: s.status,
            started_at: s.started_at,
            expires_at: s.expires_at,
        }
    }
}
