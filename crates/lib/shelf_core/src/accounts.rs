//! User accounts and the derived subscription summary.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::CancellationPolicy;
use crate::engine::Entitlements;
use crate::error::{EntitlementError, Result};
use crate::models::{Subscription, SubscriptionMirror, SubscriptionStatus, UserAccount};

/// What a user's subscriptions amount to at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSummary {
    /// Credit checks are bypassed.
    pub is_unlimited: bool,
    /// The subscription granting unlimited mode, if any.
    pub current: Option<Subscription>,
}

impl SubscriptionSummary {
    /// Mirror values the user record should carry for this summary.
    fn mirror(&self) -> (SubscriptionMirror, Option<DateTime<Utc>>) {
        match &self.current {
            // A cancelled period still runs to `expires_at`; the sweep uses
            // `next_billing_at` to find mirrors that have lapsed.
            Some(sub) if self.is_unlimited => (SubscriptionMirror::Active, sub.expires_at),
            _ => (SubscriptionMirror::Inactive, None),
        }
    }
}

impl Entitlements {
    /// Fetch the user's entitlement record, creating it on first sight.
    pub async fn ensure_user(&self, user_id: &str) -> Result<UserAccount> {
        if user_id.trim().is_empty() {
            return Err(EntitlementError::InvalidPayload("empty user id".into()));
        }
        if let Some(user) = self.store.get_user(user_id).await? {
            return Ok(user);
        }
        let user = self
            .store
            .insert_user(&UserAccount::new(user_id))
            .await?
            .into_inner();
        debug!(user_id, "created entitlement record");
        Ok(user)
    }

    /// Fetch an existing user.
    pub async fn get_user(&self, user_id: &str) -> Result<UserAccount> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("user {user_id}")))
    }

    /// Apply `change` to the user record as a conditioned write, retrying on
    /// conflict. `change` returns `Ok(false)` when no write is needed.
    pub(crate) async fn update_user_with<F>(
        &self,
        user_id: &str,
        mut change: F,
    ) -> Result<UserAccount>
    where
        F: FnMut(&mut UserAccount) -> Result<bool> + Send,
    {
        for attempt in 1..=self.config.retry.max_attempts {
            let current = self.ensure_user(user_id).await?;
            let mut next = current.clone();
            if !change(&mut next)? {
                return Ok(current);
            }
            if self.store.update_user(&next).await?.applied() {
                next.version += 1;
                return Ok(next);
            }
            self.backoff("update user", attempt).await;
        }
        Err(self.exhausted(format!("update user {user_id}")))
    }

    /// Derive unlimited mode from the user's live subscriptions.
    pub async fn subscription_summary(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionSummary> {
        let live = self.store.live_subscriptions(user_id).await?;
        let policy = self.config.cancellation_policy;

        let current = live
            .into_iter()
            .filter(|sub| match sub.status {
                SubscriptionStatus::Active => true,
                SubscriptionStatus::Cancelled => policy == CancellationPolicy::AtPeriodEnd,
                _ => false,
            })
            .filter(|sub| sub.covers(now))
            .max_by_key(|sub| sub.expires_at);

        Ok(SubscriptionSummary {
            is_unlimited: current.is_some(),
            current,
        })
    }

    /// Bring the user's mirrored subscription fields in line with the
    /// derived summary. No write when they already agree.
    pub async fn reconcile_mirror(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionSummary> {
        let summary = self.subscription_summary(user_id, now).await?;
        let (status, next_billing) = summary.mirror();
        self.update_user_with(user_id, |user| {
            if user.subscription_status == status && user.next_billing_at == next_billing {
                return Ok(false);
            }
            user.subscription_status = status;
            user.next_billing_at = next_billing;
            Ok(true)
        })
        .await?;
        Ok(summary)
    }
}
