//! Credit ledger and download accounting models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-user metered download allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditBalance {
    pub user_id: String,
    /// Never negative.
    pub credits: i32,
    pub resets_at: DateTime<Utc>,
    pub version: i64,
}

/// Balance as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    /// `None` when unlimited.
    pub credits: Option<i32>,
    pub resets_at: DateTime<Utc>,
    pub is_unlimited: bool,
}

/// Fixed-window download counter used for burst limiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DownloadWindow {
    pub user_id: String,
    pub window_start: DateTime<Utc>,
    pub count: i32,
    pub version: i64,
}

/// One permitted download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DownloadRecord {
    pub id: Uuid,
    pub user_id: String,
    pub resource_id: String,
    /// Whether the credit ledger was bypassed.
    pub unlimited: bool,
    pub created_at: DateTime<Utc>,
}
