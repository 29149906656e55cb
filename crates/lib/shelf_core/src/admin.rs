//! Administrative operations.
//!
//! Every operation takes an explicit [`Actor`]. The system actor is trusted;
//! a user actor must hold the admin role. Each call appends exactly one audit
//! entry, including calls that leave the record unchanged.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::engine::Entitlements;
use crate::error::{EntitlementError, Result};
use crate::models::{Actor, AuditAction, Role, Subscription, UserAccount};

impl Entitlements {
    /// Reject user actors that are not admins.
    pub async fn require_admin(&self, actor: &Actor) -> Result<()> {
        let Some(user_id) = actor.user_id() else {
            return Ok(());
        };
        match self.store.get_user(user_id).await? {
            Some(user) if user.is_admin() => Ok(()),
            _ => Err(EntitlementError::Forbidden(format!(
                "{user_id} is not an administrator"
            ))),
        }
    }

    pub async fn lock_account(
        &self,
        actor: &Actor,
        target: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<UserAccount> {
        self.require_admin(actor).await?;
        self.get_user(target).await?;
        let user = self
            .update_user_with(target, |u| {
                if u.is_locked && u.lock_reason.as_deref() == Some(reason) {
                    return Ok(false);
                }
                u.is_locked = true;
                u.lock_reason = Some(reason.to_string());
                u.locked_at = Some(now);
                Ok(true)
            })
            .await?;

        info!(target, actor = %actor, reason, "account locked");
        self.audit
            .record(
                AuditAction::AccountLocked,
                actor,
                Some(target),
                Some(json!({ "reason": reason })),
                now,
            )
            .await;
        Ok(user)
    }

    pub async fn unlock_account(
        &self,
        actor: &Actor,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<UserAccount> {
        self.require_admin(actor).await?;
        let before = self.get_user(target).await?;
        let user = self
            .update_user_with(target, |u| {
                if !u.is_locked {
                    return Ok(false);
                }
                u.is_locked = false;
                u.lock_reason = None;
                u.locked_at = None;
                Ok(true)
            })
            .await?;

        info!(target, actor = %actor, "account unlocked");
        self.audit
            .record(
                AuditAction::AccountUnlocked,
                actor,
                Some(target),
                before.lock_reason.map(|reason| json!({ "previousReason": reason })),
                now,
            )
            .await;
        Ok(user)
    }

    /// Promote or demote `target`.
    pub async fn set_role(
        &self,
        actor: &Actor,
        target: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<UserAccount> {
        self.require_admin(actor).await?;
        let before = self.get_user(target).await?;
        let user = self
            .update_user_with(target, |u| {
                if u.role == role {
                    return Ok(false);
                }
                u.role = role;
                Ok(true)
            })
            .await?;

        info!(target, actor = %actor, from = %before.role, to = %role, "role changed");
        self.audit
            .record(
                AuditAction::RoleChanged,
                actor,
                Some(target),
                Some(json!({ "from": before.role, "to": role })),
                now,
            )
            .await;
        Ok(user)
    }

    /// Give `target` an unpaid subscription of `duration_days`.
    pub async fn grant_subscription(
        &self,
        actor: &Actor,
        target: &str,
        duration_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        self.require_admin(actor).await?;
        self.get_user(target).await?;
        Self::subscription_period(duration_days)?;

        let reference = format!("admin-grant-{}", Uuid::new_v4());
        let pending = self.create_pending(target, &reference, 0, "", now).await?;
        let (sub, superseded) = self
            .activate_inner(pending.id, 0, "", duration_days, now)
            .await?;

        info!(target, actor = %actor, duration_days, "subscription granted");
        self.audit
            .record(
                AuditAction::SubscriptionGranted,
                actor,
                Some(target),
                Some(json!({
                    "subscriptionId": sub.id,
                    "reference": reference,
                    "durationDays": duration_days,
                    "superseded": superseded,
                })),
                now,
            )
            .await;
        Ok(sub)
    }

    /// Cancel on behalf of `actor`; users may cancel their own subscriptions.
    pub async fn cancel_subscription(
        &self,
        actor: &Actor,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        self.cancel(subscription_id, actor, now).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EntitlementConfig;
    use crate::models::{SubscriptionMirror, SubscriptionStatus};
    use crate::store::memory::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Entitlements) {
        let store = Arc::new(MemoryStore::new());
        let engine = Entitlements::new(store.clone(), EntitlementConfig::default());
        engine.ensure_user("u1").await.unwrap();
        engine.ensure_user("admin").await.unwrap();
        engine
            .set_role(&Actor::System, "admin", Role::Admin, Utc::now())
            .await
            .unwrap();
        (store, engine)
    }

    fn actions(store: &MemoryStore) -> Vec<AuditAction> {
        store.audit_entries().into_iter().map(|e| e.action).collect()
    }

    #[tokio::test]
    async fn non_admin_is_forbidden_without_side_effects() {
        let (store, engine) = setup().await;
        let before = store.audit_entries().len();

        let err = engine
            .lock_account(&Actor::user("u1"), "u1", "self", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Forbidden(_)));
        assert!(!engine.get_user("u1").await.unwrap().is_locked);
        assert_eq!(store.audit_entries().len(), before);
    }

    #[tokio::test]
    async fn lock_and_unlock_each_audit_once() {
        let (store, engine) = setup().await;
        let admin = Actor::user("admin");
        let now = Utc::now();

        let locked = engine.lock_account(&admin, "u1", "chargeback", now).await.unwrap();
        assert!(locked.is_locked);
        assert_eq!(locked.lock_reason.as_deref(), Some("chargeback"));

        let unlocked = engine.unlock_account(&admin, "u1", now).await.unwrap();
        assert!(!unlocked.is_locked);

        let entries = store.audit_entries();
        let tail: Vec<_> = entries[entries.len() - 2..].iter().collect();
        assert_eq!(tail[0].action, AuditAction::AccountLocked);
        assert_eq!(tail[0].actor_user_id.as_deref(), Some("admin"));
        assert_eq!(tail[1].action, AuditAction::AccountUnlocked);
    }

    #[tokio::test]
    async fn repeated_lock_still_audits() {
        let (store, engine) = setup().await;
        let now = Utc::now();
        engine.lock_account(&Actor::System, "u1", "fraud", now).await.unwrap();
        engine.lock_account(&Actor::System, "u1", "fraud", now).await.unwrap();
        let locks = actions(&store)
            .into_iter()
            .filter(|a| *a == AuditAction::AccountLocked)
            .count();
        assert_eq!(locks, 2);
    }

    #[tokio::test]
    async fn rejected_grant_leaves_no_record() {
        let (store, engine) = setup().await;
        let now = Utc::now();
        for days in [0, -3, i64::MAX] {
            let err = engine
                .grant_subscription(&Actor::System, "u1", days, now)
                .await
                .unwrap_err();
            assert!(matches!(err, EntitlementError::InvalidPayload(_)), "{days}");
        }
        assert!(store.subscriptions_for("u1").is_empty());
        assert!(!actions(&store).contains(&AuditAction::SubscriptionGranted));
    }

    #[tokio::test]
    async fn lock_commits_when_audit_is_down() {
        let (store, engine) = setup().await;
        store.set_audit_failure(true);

        let locked = engine
            .lock_account(&Actor::System, "u1", "chargeback", Utc::now())
            .await
            .unwrap();
        assert!(locked.is_locked);
        assert!(engine.get_user("u1").await.unwrap().is_locked);
        assert!(!actions(&store).contains(&AuditAction::AccountLocked));
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let (_, engine) = setup().await;
        assert!(matches!(
            engine.unlock_account(&Actor::System, "ghost", Utc::now()).await,
            Err(EntitlementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn grant_activates_without_payment() {
        let (store, engine) = setup().await;
        let now = Utc::now();
        let sub = engine
            .grant_subscription(&Actor::user("admin"), "u1", 14, now)
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.amount, 0);
        assert!(sub.external_reference.starts_with("admin-grant-"));
        assert_eq!(
            engine.get_user("u1").await.unwrap().subscription_status,
            SubscriptionMirror::Active
        );

        let log = actions(&store);
        assert_eq!(log.last(), Some(&AuditAction::SubscriptionGranted));
        assert!(!log.contains(&AuditAction::SubscriptionActivated));
    }

    #[tokio::test]
    async fn demoted_admin_loses_access() {
        let (_, engine) = setup().await;
        let now = Utc::now();
        engine
            .set_role(&Actor::System, "admin", Role::User, now)
            .await
            .unwrap();
        assert!(matches!(
            engine.set_role(&Actor::user("admin"), "u1", Role::Admin, now).await,
            Err(EntitlementError::Forbidden(_))
        ));
    }
}
