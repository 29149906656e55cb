//! Download entitlement gate.
//!
//! Expected refusals come back as a [`Decision`]; only infrastructure and
//! lookup failures are errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RateLimitPolicy;
use crate::engine::Entitlements;
use crate::error::{EntitlementError, Result};
use crate::models::DownloadRecord;
use crate::uuid::uuidv7;

/// Machine-readable reason for a refused download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    AccountLocked,
    InsufficientCredits,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    /// Credits left after this request; `None` for unlimited users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_credits: Option<i32>,
}

impl Decision {
    fn allow(remaining_credits: Option<i32>) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_credits,
        }
    }

    fn deny(reason: DenialReason, remaining_credits: Option<i32>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining_credits,
        }
    }
}

enum Slot {
    Reserved(DateTime<Utc>),
    Unmetered,
    Full,
}

impl Entitlements {
    /// Decide whether `user_id` may download `resource_id` now, consuming a
    /// credit and a rate-window slot when permitted.
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let user = self.get_user(user_id).await?;
        if user.is_locked {
            debug!(user_id, resource_id, "download denied: account locked");
            return Ok(Decision::deny(DenialReason::AccountLocked, None));
        }

        let summary = self.subscription_summary(user_id, now).await?;
        if summary.is_unlimited {
            if self.config.rate_limit_unlimited
                && let Slot::Full = self.take_slot(user_id, now).await?
            {
                return Ok(Decision::deny(DenialReason::RateLimited, None));
            }
            self.record_download(user_id, resource_id, true, now).await;
            return Ok(Decision::allow(None));
        }

        let slot = match self.take_slot(user_id, now).await? {
            Slot::Full => {
                let credits = self.ensure_balance(user_id, now).await?.credits;
                return Ok(Decision::deny(DenialReason::RateLimited, Some(credits)));
            }
            Slot::Reserved(start) => Some(start),
            Slot::Unmetered => None,
        };

        match self.debit_metered(user_id, 1, now).await {
            Ok(remaining) => {
                self.record_download(user_id, resource_id, false, now).await;
                Ok(Decision::allow(Some(remaining)))
            }
            Err(EntitlementError::InsufficientCredits) => {
                self.release_slot(user_id, slot).await;
                debug!(user_id, resource_id, "download denied: no credits");
                Ok(Decision::deny(DenialReason::InsufficientCredits, Some(0)))
            }
            Err(e) => {
                self.release_slot(user_id, slot).await;
                Err(e)
            }
        }
    }

    async fn take_slot(&self, user_id: &str, now: DateTime<Utc>) -> Result<Slot> {
        let policy = self.config.rate_limit_policy;
        if policy == RateLimitPolicy::Disabled {
            return Ok(Slot::Unmetered);
        }
        match self.reserve_download_slot(user_id, now).await? {
            Some(start) => Ok(Slot::Reserved(start)),
            None if policy == RateLimitPolicy::Advisory => {
                warn!(user_id, "download window exceeded, allowing under advisory policy");
                Ok(Slot::Unmetered)
            }
            None => {
                info!(user_id, "download denied: rate limited");
                Ok(Slot::Full)
            }
        }
    }

    async fn release_slot(&self, user_id: &str, slot: Option<DateTime<Utc>>) {
        let Some(start) = slot else {
            return;
        };
        if let Err(e) = self.release_download_slot(user_id, start).await {
            warn!(user_id, "failed to release download slot: {e}");
        }
    }

    async fn record_download(
        &self,
        user_id: &str,
        resource_id: &str,
        unlimited: bool,
        now: DateTime<Utc>,
    ) {
        let record = DownloadRecord {
            id: uuidv7(),
            user_id: user_id.to_string(),
            resource_id: resource_id.to_string(),
            unlimited,
            created_at: now,
        };
        if let Err(e) = self.store.append_download(&record).await {
            warn!(user_id, resource_id, "failed to record download: {e}");
        }
    }
}
