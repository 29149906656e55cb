//! Credit ledger and the short-window download limiter.
//!
//! Every mutation is a conditioned write on the record's version, retried
//! under [`crate::config::RetryPolicy`]. `now` is always passed in so resets
//! are deterministic with respect to the caller's clock.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SWEEP_BATCH_SIZE;
use crate::engine::Entitlements;
use crate::error::{EntitlementError, Result};
use crate::models::{Actor, AuditAction, BalanceView, CreditBalance, DownloadWindow};
use crate::store::Inserted;

impl Entitlements {
    /// Fetch the user's balance, creating a full allowance on first need.
    pub async fn ensure_balance(&self, user_id: &str, now: DateTime<Utc>) -> Result<CreditBalance> {
        if let Some(balance) = self.store.get_balance(user_id).await? {
            return Ok(balance);
        }
        let fresh = CreditBalance {
            user_id: user_id.to_string(),
            credits: self.config.free_monthly_credits,
            resets_at: self.config.reset_schedule.next_after(now, now),
            version: 0,
        };
        Ok(self.store.insert_balance(&fresh).await?.into_inner())
    }

    /// Conditioned balance update with retry. `change` returns `Ok(false)`
    /// when no write is needed; the second element reports whether one landed.
    async fn update_balance_with<F>(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        mut change: F,
    ) -> Result<(CreditBalance, bool)>
    where
        F: FnMut(&mut CreditBalance) -> Result<bool> + Send,
    {
        for attempt in 1..=self.config.retry.max_attempts {
            let current = self.ensure_balance(user_id, now).await?;
            let mut next = current.clone();
            if !change(&mut next)? {
                return Ok((current, false));
            }
            if self.store.update_balance(&next).await?.applied() {
                next.version += 1;
                return Ok((next, true));
            }
            self.backoff("update balance", attempt).await;
        }
        Err(self.exhausted(format!("update balance {user_id}")))
    }

    /// Refill the allowance if the reset boundary has passed. Returns whether
    /// this call performed the reset; a second call in the same window is a
    /// no-op.
    pub async fn reset_if_due(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let allowance = self.config.free_monthly_credits;
        let schedule = self.config.reset_schedule;
        let (balance, reset) = self
            .update_balance_with(user_id, now, |b| {
                if now < b.resets_at {
                    return Ok(false);
                }
                b.credits = allowance;
                b.resets_at = schedule.next_after(b.resets_at, now);
                Ok(true)
            })
            .await?;

        if reset {
            info!(user_id, resets_at = %balance.resets_at, "credits reset");
            self.audit
                .record(
                    AuditAction::CreditsReset,
                    &Actor::System,
                    Some(user_id),
                    Some(json!({ "credits": balance.credits, "resetsAt": balance.resets_at })),
                    now,
                )
                .await;
        }
        Ok(reset)
    }

    /// Unconditionally restore a full allowance and start a new reset window.
    pub(crate) async fn restart_allowance(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditBalance> {
        let allowance = self.config.free_monthly_credits;
        let resets_at = self.config.reset_schedule.next_after(now, now);
        let (balance, _) = self
            .update_balance_with(user_id, now, |b| {
                if b.credits == allowance && b.resets_at == resets_at {
                    return Ok(false);
                }
                b.credits = allowance;
                b.resets_at = resets_at;
                Ok(true)
            })
            .await?;
        Ok(balance)
    }

    /// Current balance, applying a due reset first.
    pub async fn get_balance(&self, user_id: &str, now: DateTime<Utc>) -> Result<BalanceView> {
        self.reset_if_due(user_id, now).await?;
        let balance = self.ensure_balance(user_id, now).await?;
        let summary = self.subscription_summary(user_id, now).await?;
        Ok(BalanceView {
            credits: (!summary.is_unlimited).then_some(balance.credits),
            resets_at: balance.resets_at,
            is_unlimited: summary.is_unlimited,
        })
    }

    /// Take `amount` credits. Unlimited users are not touched and get `None`;
    /// otherwise the remaining balance is returned.
    pub async fn debit(
        &self,
        user_id: &str,
        amount: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        if self.subscription_summary(user_id, now).await?.is_unlimited {
            debug!(user_id, "debit skipped for unlimited user");
            return Ok(None);
        }
        self.debit_metered(user_id, amount, now).await.map(Some)
    }

    /// Debit without consulting subscriptions. The caller has already
    /// established the user is metered.
    pub(crate) async fn debit_metered(
        &self,
        user_id: &str,
        amount: i32,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        if amount <= 0 {
            return Err(EntitlementError::InvalidPayload(format!(
                "debit amount must be positive, got {amount}"
            )));
        }
        self.reset_if_due(user_id, now).await?;
        let (balance, _) = self
            .update_balance_with(user_id, now, |b| {
                if b.credits < amount {
                    return Err(EntitlementError::InsufficientCredits);
                }
                b.credits -= amount;
                Ok(true)
            })
            .await?;
        debug!(user_id, amount, remaining = balance.credits, "credits debited");
        Ok(balance.credits)
    }

    /// Give back credits taken by a debit whose follow-up failed. Never
    /// raises the balance above the allowance.
    pub async fn refund(&self, user_id: &str, amount: i32, now: DateTime<Utc>) -> Result<i32> {
        if amount <= 0 {
            return Err(EntitlementError::InvalidPayload(format!(
                "refund amount must be positive, got {amount}"
            )));
        }
        let allowance = self.config.free_monthly_credits;
        let (balance, _) = self
            .update_balance_with(user_id, now, |b| {
                let refunded = b.credits.saturating_add(amount).min(allowance);
                if refunded == b.credits {
                    return Ok(false);
                }
                b.credits = refunded;
                Ok(true)
            })
            .await?;
        Ok(balance.credits)
    }

    /// Sweep: reset every balance whose boundary has passed. Returns the
    /// number of balances reset by this call.
    pub async fn reset_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut reset = 0;
        loop {
            let due = self.store.balances_due(now, SWEEP_BATCH_SIZE).await?;
            let batch_len = due.len();
            let mut progressed = 0;
            for balance in due {
                match self.reset_if_due(&balance.user_id, now).await {
                    Ok(applied) => {
                        progressed += 1;
                        if applied {
                            reset += 1;
                        }
                    }
                    Err(e) => warn!(user_id = %balance.user_id, "credit reset failed: {e}"),
                }
            }
            if progressed == 0 || (batch_len as i64) < SWEEP_BATCH_SIZE {
                break;
            }
        }
        Ok(reset)
    }

    /// Count one download against the user's fixed window. Returns the start
    /// of the window the slot was taken in, or `None` if the window is full.
    pub(crate) async fn reserve_download_slot(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let max = self.config.max_downloads;
        let window = self.config.window;

        for attempt in 1..=self.config.retry.max_attempts {
            let current = match self.store.get_download_window(user_id).await? {
                Some(w) => w,
                None => {
                    let first = DownloadWindow {
                        user_id: user_id.to_string(),
                        window_start: now,
                        count: 1,
                        version: 0,
                    };
                    match self.store.insert_download_window(&first).await? {
                        Inserted::Created(_) if max > 0 => return Ok(Some(now)),
                        Inserted::Created(w) | Inserted::Existing(w) => w,
                    }
                }
            };

            let mut next = current.clone();
            if now >= next.window_start + window {
                next.window_start = now;
                next.count = 0;
            }
            if next.count >= max {
                return Ok(None);
            }
            next.count += 1;
            if self.store.update_download_window(&next).await?.applied() {
                return Ok(Some(next.window_start));
            }
            self.backoff("reserve download slot", attempt).await;
        }
        Err(self.exhausted(format!("reserve download slot {user_id}")))
    }

    /// Undo a reservation made in the window starting at `window_start`.
    /// A window that has since rolled over is left alone.
    pub(crate) async fn release_download_slot(
        &self,
        user_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<()> {
        for attempt in 1..=self.config.retry.max_attempts {
            let Some(current) = self.store.get_download_window(user_id).await? else {
                return Ok(());
            };
            if current.window_start != window_start || current.count == 0 {
                return Ok(());
            }
            let mut next = current;
            next.count -= 1;
            if self.store.update_download_window(&next).await?.applied() {
                return Ok(());
            }
            self.backoff("release download slot", attempt).await;
        }
        Err(self.exhausted(format!("release download slot {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::config::{EntitlementConfig, ResetSchedule};
    use crate::store::LedgerStore;
    use crate::store::memory::MemoryStore;

    fn engine() -> (Arc<MemoryStore>, Entitlements) {
        engine_with(EntitlementConfig::default())
    }

    fn engine_with(config: EntitlementConfig) -> (Arc<MemoryStore>, Entitlements) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Entitlements::new(store, config))
    }

    #[tokio::test]
    async fn new_balance_gets_full_allowance() {
        let (_, engine) = engine();
        let now = Utc::now();
        let view = engine.get_balance("u1", now).await.unwrap();
        assert_eq!(view.credits, Some(5));
        assert!(!view.is_unlimited);
        assert_eq!(view.resets_at, now + Duration::days(30));
    }

    #[tokio::test]
    async fn debit_stops_at_zero() {
        let (store, engine) = engine();
        let now = Utc::now();
        for remaining in (0..5).rev() {
            assert_eq!(engine.debit("u1", 1, now).await.unwrap(), Some(remaining));
        }
        assert!(matches!(
            engine.debit("u1", 1, now).await,
            Err(EntitlementError::InsufficientCredits)
        ));
        assert_eq!(store.get_balance("u1").await.unwrap().unwrap().credits, 0);
    }

    #[tokio::test]
    async fn debit_rejects_non_positive_amounts() {
        let (_, engine) = engine();
        assert!(matches!(
            engine.debit("u1", 0, Utc::now()).await,
            Err(EntitlementError::InvalidPayload(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_never_overspend() {
        let (store, engine) = engine();
        let now = Utc::now();
        engine.ensure_balance("u1", now).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.debit("u1", 1, now).await })
            })
            .collect();

        let mut ok = 0;
        let mut insufficient = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EntitlementError::InsufficientCredits) => insufficient += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 5);
        assert_eq!(insufficient, 15);
        assert_eq!(store.get_balance("u1").await.unwrap().unwrap().credits, 0);
    }

    #[tokio::test]
    async fn reset_if_due_is_idempotent_within_a_window() {
        let (store, engine) = engine();
        let start = Utc::now();
        engine.debit("u1", 3, start).await.unwrap();

        let later = start + Duration::days(31);
        assert!(engine.reset_if_due("u1", later).await.unwrap());
        assert!(!engine.reset_if_due("u1", later).await.unwrap());

        let balance = store.get_balance("u1").await.unwrap().unwrap();
        assert_eq!(balance.credits, 5);
        assert_eq!(balance.resets_at, start + Duration::days(60));

        let resets = store
            .audit_entries()
            .into_iter()
            .filter(|e| e.action == AuditAction::CreditsReset)
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn calendar_schedule_resets_on_the_first() {
        let config = EntitlementConfig {
            reset_schedule: ResetSchedule::CalendarMonth,
            ..EntitlementConfig::default()
        };
        let (_, engine) = engine_with(config);
        let now = "2026-03-14T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let balance = engine.ensure_balance("u1", now).await.unwrap();
        assert_eq!(
            balance.resets_at,
            "2026-04-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[tokio::test]
    async fn refund_is_capped_at_allowance() {
        let (_, engine) = engine();
        let now = Utc::now();
        engine.debit("u1", 2, now).await.unwrap();
        assert_eq!(engine.refund("u1", 1, now).await.unwrap(), 4);
        assert_eq!(engine.refund("u1", 10, now).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn reset_due_sweeps_every_due_balance() {
        let (_, engine) = engine();
        let start = Utc::now();
        for user in ["a", "b", "c"] {
            engine.debit(user, 1, start).await.unwrap();
        }
        let later = start + Duration::days(30);
        assert_eq!(engine.reset_due(later).await.unwrap(), 3);
        assert_eq!(engine.reset_due(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn download_window_fills_and_rolls_over() {
        let config = EntitlementConfig {
            max_downloads: 2,
            ..EntitlementConfig::default()
        };
        let (_, engine) = engine_with(config);
        let now = Utc::now();

        assert_eq!(engine.reserve_download_slot("u1", now).await.unwrap(), Some(now));
        assert!(engine.reserve_download_slot("u1", now).await.unwrap().is_some());
        assert_eq!(engine.reserve_download_slot("u1", now).await.unwrap(), None);

        let next_hour = now + Duration::hours(1);
        assert_eq!(
            engine.reserve_download_slot("u1", next_hour).await.unwrap(),
            Some(next_hour)
        );
    }

    #[tokio::test]
    async fn released_slot_can_be_reused() {
        let config = EntitlementConfig {
            max_downloads: 1,
            ..EntitlementConfig::default()
        };
        let (_, engine) = engine_with(config);
        let now = Utc::now();

        let start = engine.reserve_download_slot("u1", now).await.unwrap().unwrap();
        assert_eq!(engine.reserve_download_slot("u1", now).await.unwrap(), None);
        engine.release_download_slot("u1", start).await.unwrap();
        assert!(engine.reserve_download_slot("u1", now).await.unwrap().is_some());
    }
}
