//! In-memory ledger store.
//!
//! Each method takes the internal lock for the duration of a single
//! read or conditioned write, never across an `.await`, so it behaves like a
//! document store with per-record atomic compare-and-swap. Suitable for tests
//! and single-process embedding; state is lost on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Cas, Inserted, LedgerStore, StoreError, StoreResult};
use crate::models::{
    AuditAction, AuditLogEntry, CreditBalance, DownloadRecord, DownloadWindow, PaymentEvent,
    Subscription, SubscriptionMirror, SubscriptionStatus, UserAccount,
};

#[derive(Debug, Default)]
struct State {
    users: HashMap<String, UserAccount>,
    subscriptions: HashMap<Uuid, Subscription>,
    /// external reference -> subscription id
    references: HashMap<String, Uuid>,
    balances: HashMap<String, CreditBalance>,
    windows: HashMap<String, DownloadWindow>,
    downloads: Vec<DownloadRecord>,
    payment_events: HashMap<String, PaymentEvent>,
    audit: Vec<AuditLogEntry>,
}

/// Ledger store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_audit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent audit append fail (for exercising best-effort audit).
    pub fn set_audit_failure(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the audit log, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.lock().map(|s| s.audit.clone()).unwrap_or_default()
    }

    /// Snapshot of recorded downloads, oldest first.
    pub fn downloads(&self) -> Vec<DownloadRecord> {
        self.lock().map(|s| s.downloads.clone()).unwrap_or_default()
    }

    /// Every subscription ever created for `user_id`, oldest first.
    pub fn subscriptions_for(&self, user_id: &str) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .lock()
            .map(|s| {
                s.subscriptions
                    .values()
                    .filter(|sub| sub.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        subs.sort_by_key(|sub| sub.id);
        subs
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

/// Replace `slot` with `next` (version bumped) if the versions match.
fn swap<T: Clone>(
    slot: Option<&mut T>,
    next: &T,
    version: impl Fn(&T) -> i64,
    bump: impl Fn(&mut T),
) -> Cas {
    match slot {
        Some(current) if version(current) == version(next) => {
            *current = next.clone();
            bump(current);
            Cas::Applied
        }
        _ => Cas::Conflict,
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        Ok(self.lock()?.users.get(user_id).cloned())
    }

    async fn insert_user(&self, user: &UserAccount) -> StoreResult<Inserted<UserAccount>> {
        let mut state = self.lock()?;
        if let Some(existing) = state.users.get(&user.user_id) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        state.users.insert(user.user_id.clone(), user.clone());
        Ok(Inserted::Created(user.clone()))
    }

    async fn update_user(&self, user: &UserAccount) -> StoreResult<Cas> {
        let mut state = self.lock()?;
        Ok(swap(
            state.users.get_mut(&user.user_id),
            user,
            |u| u.version,
            |u| u.version += 1,
        ))
    }

    async fn users_with_lapsed_mirror(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UserAccount>> {
        let state = self.lock()?;
        let mut due: Vec<UserAccount> = state
            .users
            .values()
            .filter(|u| {
                u.subscription_status == SubscriptionMirror::Active
                    && u.next_billing_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|u| u.next_billing_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn insert_subscription(
        &self,
        sub: &Subscription,
    ) -> StoreResult<Inserted<Subscription>> {
        let mut state = self.lock()?;
        if let Some(id) = state.references.get(&sub.external_reference)
            && let Some(existing) = state.subscriptions.get(id)
        {
            return Ok(Inserted::Existing(existing.clone()));
        }
        state
            .references
            .insert(sub.external_reference.clone(), sub.id);
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(Inserted::Created(sub.clone()))
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(&id).cloned())
    }

    async fn find_subscription_by_reference(
        &self,
        reference: &str,
    ) -> StoreResult<Option<Subscription>> {
        let state = self.lock()?;
        Ok(state
            .references
            .get(reference)
            .and_then(|id| state.subscriptions.get(id))
            .cloned())
    }

    async fn live_subscriptions(&self, user_id: &str) -> StoreResult<Vec<Subscription>> {
        let state = self.lock()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                s.user_id == user_id
                    && matches!(
                        s.status,
                        SubscriptionStatus::Active | SubscriptionStatus::Cancelled
                    )
            })
            .cloned()
            .collect())
    }

    async fn active_subscriptions_expiring(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let state = self.lock()?;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active && s.expires_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.expires_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<Cas> {
        let mut state = self.lock()?;
        if sub.status == SubscriptionStatus::Active {
            let other_active = state.subscriptions.values().any(|s| {
                s.user_id == sub.user_id && s.id != sub.id && s.status == SubscriptionStatus::Active
            });
            if other_active {
                return Ok(Cas::Conflict);
            }
        }
        Ok(swap(
            state.subscriptions.get_mut(&sub.id),
            sub,
            |s| s.version,
            |s| s.version += 1,
        ))
    }

    async fn get_balance(&self, user_id: &str) -> StoreResult<Option<CreditBalance>> {
        Ok(self.lock()?.balances.get(user_id).cloned())
    }

    async fn insert_balance(
        &self,
        balance: &CreditBalance,
    ) -> StoreResult<Inserted<CreditBalance>> {
        let mut state = self.lock()?;
        if let Some(existing) = state.balances.get(&balance.user_id) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        state
            .balances
            .insert(balance.user_id.clone(), balance.clone());
        Ok(Inserted::Created(balance.clone()))
    }

    async fn update_balance(&self, balance: &CreditBalance) -> StoreResult<Cas> {
        if balance.credits < 0 {
            return Err(StoreError::Corrupt(format!(
                "negative credit balance for {}",
                balance.user_id
            )));
        }
        let mut state = self.lock()?;
        Ok(swap(
            state.balances.get_mut(&balance.user_id),
            balance,
            |b| b.version,
            |b| b.version += 1,
        ))
    }

    async fn balances_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<CreditBalance>> {
        let state = self.lock()?;
        let mut due: Vec<CreditBalance> = state
            .balances
            .values()
            .filter(|b| b.resets_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|b| b.resets_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn get_download_window(&self, user_id: &str) -> StoreResult<Option<DownloadWindow>> {
        Ok(self.lock()?.windows.get(user_id).cloned())
    }

    async fn insert_download_window(
        &self,
        window: &DownloadWindow,
    ) -> StoreResult<Inserted<DownloadWindow>> {
        let mut state = self.lock()?;
        if let Some(existing) = state.windows.get(&window.user_id) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        state.windows.insert(window.user_id.clone(), window.clone());
        Ok(Inserted::Created(window.clone()))
    }

    async fn update_download_window(&self, window: &DownloadWindow) -> StoreResult<Cas> {
        let mut state = self.lock()?;
        Ok(swap(
            state.windows.get_mut(&window.user_id),
            window,
            |w| w.version,
            |w| w.version += 1,
        ))
    }

    async fn append_download(&self, record: &DownloadRecord) -> StoreResult<()> {
        self.lock()?.downloads.push(record.clone());
        Ok(())
    }

    async fn get_payment_event(&self, reference: &str) -> StoreResult<Option<PaymentEvent>> {
        Ok(self.lock()?.payment_events.get(reference).cloned())
    }

    async fn put_payment_event(&self, event: &PaymentEvent) -> StoreResult<()> {
        self.lock()?
            .payment_events
            .insert(event.reference.clone(), event.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit log unavailable".into()));
        }
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_recorded(
        &self,
        action: AuditAction,
        subscription_id: Uuid,
    ) -> StoreResult<bool> {
        let id = subscription_id.to_string();
        Ok(self.lock()?.audit.iter().any(|e| {
            e.action == action
                && e.details
                    .as_ref()
                    .and_then(|d| d.get("subscriptionId"))
                    .and_then(|v| v.as_str())
                    == Some(id.as_str())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let user = store
            .insert_user(&UserAccount::new("u1"))
            .await
            .unwrap()
            .into_inner();

        let mut first = user.clone();
        first.is_locked = true;
        assert_eq!(store.update_user(&first).await.unwrap(), Cas::Applied);

        // Same base version again: someone else already wrote.
        let mut second = user.clone();
        second.lock_reason = Some("late".into());
        assert_eq!(store.update_user(&second).await.unwrap(), Cas::Conflict);

        let stored = store.get_user("u1").await.unwrap().unwrap();
        assert!(stored.is_locked);
        assert_eq!(stored.lock_reason, None);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn second_active_subscription_is_a_conflict() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for reference in ["P1", "P2"] {
            store
                .insert_subscription(&Subscription::pending("u1", reference, 100, "NGN", now))
                .await
                .unwrap();
        }
        let mut a = store.find_subscription_by_reference("P1").await.unwrap().unwrap();
        let mut b = store.find_subscription_by_reference("P2").await.unwrap().unwrap();
        a.status = SubscriptionStatus::Active;
        b.status = SubscriptionStatus::Active;

        assert_eq!(store.update_subscription(&a).await.unwrap(), Cas::Applied);
        assert_eq!(store.update_subscription(&b).await.unwrap(), Cas::Conflict);
    }

    #[tokio::test]
    async fn duplicate_reference_returns_existing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Subscription::pending("u1", "P1", 100, "NGN", now);
        let again = Subscription::pending("u2", "P1", 999, "USD", now);

        assert!(matches!(
            store.insert_subscription(&first).await.unwrap(),
            Inserted::Created(_)
        ));
        match store.insert_subscription(&again).await.unwrap() {
            Inserted::Existing(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected existing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negative_balance_is_refused() {
        let store = MemoryStore::new();
        let balance = CreditBalance {
            user_id: "u1".into(),
            credits: 1,
            resets_at: Utc::now(),
            version: 0,
        };
        store.insert_balance(&balance).await.unwrap();
        let broken = CreditBalance {
            credits: -1,
            ..balance
        };
        assert!(store.update_balance(&broken).await.is_err());
    }
}
