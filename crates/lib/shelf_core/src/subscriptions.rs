//! Subscription lifecycle.
//!
//! Transitions go through [`SubscriptionStatus::can_transition_to`]; every
//! write is conditioned on the version that was read. The single-active rule
//! is enforced by the store, so activation expires any other active record
//! and retries until its own write lands.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SWEEP_BATCH_SIZE;
use crate::engine::Entitlements;
use crate::error::{EntitlementError, Result};
use crate::models::{Actor, AuditAction, Subscription, SubscriptionStatus};
use crate::store::Inserted;

impl Entitlements {
    /// Record a checkout before the gateway confirms it.
    ///
    /// Fails with [`EntitlementError::DuplicatePayment`] if the reference is
    /// already known; callers treat that as success.
    pub async fn create_pending(
        &self,
        user_id: &str,
        reference: &str,
        amount: i64,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        if reference.trim().is_empty() {
            return Err(EntitlementError::InvalidPayload("empty payment reference".into()));
        }
        self.ensure_user(user_id).await?;
        let pending = Subscription::pending(user_id, reference, amount, currency, now);
        match self.store.insert_subscription(&pending).await? {
            Inserted::Created(sub) => {
                info!(
                    user_id,
                    reference,
                    subscription_id = %sub.id,
                    "pending subscription created"
                );
                Ok(sub)
            }
            Inserted::Existing(_) => {
                Err(EntitlementError::DuplicatePayment(reference.to_string()))
            }
        }
    }

    pub async fn get_subscription(&self, id: Uuid) -> Result<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("subscription {id}")))
    }

    /// Conditioned single-record transition to `to`, retried on conflict.
    async fn transition(
        &self,
        id: Uuid,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        for attempt in 1..=self.config.retry.max_attempts {
            let current = self.get_subscription(id).await?;
            if !current.status.can_transition_to(to) {
                return Err(EntitlementError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            let mut next = current;
            next.status = to;
            next.updated_at = now;
            if self.store.update_subscription(&next).await?.applied() {
                next.version += 1;
                return Ok(next);
            }
            self.backoff("subscription transition", attempt).await;
        }
        Err(self.exhausted(format!("transition subscription {id} to {to}")))
    }

    /// `pending -> active` for a confirmed payment.
    pub async fn activate(
        &self,
        id: Uuid,
        amount: i64,
        currency: &str,
        duration_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let (sub, superseded) = self
            .activate_inner(id, amount, currency, duration_days, now)
            .await?;
        self.record_activation(&sub, &superseded, now).await;
        Ok(sub)
    }

    async fn record_activation(
        &self,
        sub: &Subscription,
        superseded: &[Uuid],
        now: DateTime<Utc>,
    ) {
        self.audit
            .record(
                AuditAction::SubscriptionActivated,
                &Actor::System,
                Some(&sub.user_id),
                Some(json!({
                    "subscriptionId": sub.id,
                    "reference": sub.external_reference,
                    "expiresAt": sub.expires_at,
                    "superseded": superseded,
                })),
                now,
            )
            .await;
    }

    /// Re-run the follow-up writes of an activation that already landed.
    ///
    /// The mirror is always reconciled. A missing activation audit entry means
    /// the earlier run stopped after its conditioned write, so the allowance
    /// restart and the audit entry are redone.
    pub(crate) async fn repair_activation(
        &self,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.reconcile_mirror(&sub.user_id, now).await?;
        if self
            .store
            .audit_recorded(AuditAction::SubscriptionActivated, sub.id)
            .await?
        {
            return Ok(());
        }
        warn!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            "activation follow-ups missing, repairing"
        );
        self.restart_allowance(&sub.user_id, now).await?;
        self.record_activation(sub, &[], now).await;
        Ok(())
    }

    /// Duration of a paid period, rejecting zero, negative and overflowing values.
    pub(crate) fn subscription_period(duration_days: i64) -> Result<Duration> {
        Duration::try_days(duration_days)
            .filter(|d| *d > Duration::zero())
            .ok_or_else(|| {
                EntitlementError::InvalidPayload(format!(
                    "invalid subscription duration: {duration_days} days"
                ))
            })
    }

    /// Activation without the audit entry, shared with admin grants.
    /// Returns the activated record and the ids of records it superseded.
    pub(crate) async fn activate_inner(
        &self,
        id: Uuid,
        amount: i64,
        currency: &str,
        duration_days: i64,
        now: DateTime<Utc>,
    ) -> Result<(Subscription, Vec<Uuid>)> {
        let period = Self::subscription_period(duration_days)?;

        let mut superseded = Vec::new();
        let mut activated = None;
        for attempt in 1..=self.config.retry.max_attempts {
            let current = self.get_subscription(id).await?;
            if !current.status.can_transition_to(SubscriptionStatus::Active) {
                return Err(EntitlementError::InvalidTransition {
                    from: current.status,
                    to: SubscriptionStatus::Active,
                });
            }

            for other in self.store.live_subscriptions(&current.user_id).await? {
                if other.id == current.id || other.status != SubscriptionStatus::Active {
                    continue;
                }
                let mut expired = other;
                expired.status = SubscriptionStatus::Expired;
                expired.updated_at = now;
                if self.store.update_subscription(&expired).await?.applied() {
                    info!(
                        user_id = %expired.user_id,
                        subscription_id = %expired.id,
                        "superseded active subscription expired"
                    );
                    superseded.push(expired.id);
                }
            }

            let mut next = current;
            next.status = SubscriptionStatus::Active;
            next.amount = amount;
            next.currency = currency.to_string();
            next.started_at = Some(now);
            next.expires_at = Some(now + period);
            next.updated_at = now;
            if self.store.update_subscription(&next).await?.applied() {
                next.version += 1;
                activated = Some(next);
                break;
            }
            self.backoff("activate subscription", attempt).await;
        }
        let Some(sub) = activated else {
            return Err(self.exhausted(format!("activate subscription {id}")));
        };

        info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            expires_at = ?sub.expires_at,
            "subscription activated"
        );
        self.restart_allowance(&sub.user_id, now).await?;
        self.reconcile_mirror(&sub.user_id, now).await?;
        Ok((sub, superseded))
    }

    /// Sweep: expire every active subscription whose period has ended, then
    /// bring lapsed user mirrors back in line. Returns the number expired.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        let mut touched = BTreeSet::new();

        loop {
            let due = self
                .store
                .active_subscriptions_expiring(now, SWEEP_BATCH_SIZE)
                .await?;
            let batch_len = due.len();
            let mut applied = 0;
            for sub in due {
                let mut next = sub;
                next.status = SubscriptionStatus::Expired;
                next.updated_at = now;
                // Conditioned on the version read above; a record that moved
                // since is left for the next pass.
                if !self.store.update_subscription(&next).await?.applied() {
                    continue;
                }
                applied += 1;
                info!(user_id = %next.user_id, subscription_id = %next.id, "subscription expired");
                self.audit
                    .record(
                        AuditAction::SubscriptionExpired,
                        &Actor::System,
                        Some(&next.user_id),
                        Some(json!({ "subscriptionId": next.id, "expiresAt": next.expires_at })),
                        now,
                    )
                    .await;
                touched.insert(next.user_id);
            }
            expired += applied;
            if applied == 0 || (batch_len as i64) < SWEEP_BATCH_SIZE {
                break;
            }
        }

        for user_id in &touched {
            if let Err(e) = self.reconcile_mirror(user_id, now).await {
                warn!(user_id = %user_id, "mirror reconcile failed: {e}");
            }
        }

        loop {
            let lapsed = self
                .store
                .users_with_lapsed_mirror(now, SWEEP_BATCH_SIZE)
                .await?;
            let batch_len = lapsed.len();
            let mut reconciled = 0;
            for user in lapsed {
                match self.reconcile_mirror(&user.user_id, now).await {
                    Ok(_) => reconciled += 1,
                    Err(e) => warn!(user_id = %user.user_id, "mirror reconcile failed: {e}"),
                }
            }
            if reconciled == 0 || (batch_len as i64) < SWEEP_BATCH_SIZE {
                break;
            }
        }

        Ok(expired)
    }

    /// `active -> cancelled`. The owner, an admin or the system may cancel.
    pub async fn cancel(
        &self,
        id: Uuid,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let sub = self.get_subscription(id).await?;
        if actor.user_id() != Some(sub.user_id.as_str()) {
            self.require_admin(actor).await?;
        }

        let sub = self.transition(id, SubscriptionStatus::Cancelled, now).await?;
        info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            actor = %actor,
            policy = ?self.config.cancellation_policy,
            "subscription cancelled"
        );
        self.audit
            .record(
                AuditAction::SubscriptionCancelled,
                actor,
                Some(&sub.user_id),
                Some(json!({
                    "subscriptionId": sub.id,
                    "policy": self.config.cancellation_policy,
                })),
                now,
            )
            .await;
        self.reconcile_mirror(&sub.user_id, now).await?;
        Ok(sub)
    }

    /// `pending -> failed` for a declined or abandoned payment.
    pub async fn fail(&self, id: Uuid, now: DateTime<Utc>) -> Result<Subscription> {
        let sub = self.transition(id, SubscriptionStatus::Failed, now).await?;
        info!(user_id = %sub.user_id, subscription_id = %sub.id, "payment failed");
        self.audit
            .record(
                AuditAction::PaymentFailed,
                &Actor::System,
                Some(&sub.user_id),
                Some(json!({ "subscriptionId": sub.id, "reference": sub.external_reference })),
                now,
            )
            .await;
        Ok(sub)
    }
}
