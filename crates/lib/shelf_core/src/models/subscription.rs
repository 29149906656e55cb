//! Subscription domain models and the status transition table.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription lifecycle status matching the `subscription_status` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
    Cancelled,
    Failed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Failed => "failed",
        }
    }

    /// The complete transition table. Anything not listed is rejected.
    ///
    /// A terminal record never becomes `active` again; a new payment creates
    /// a new record instead.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            (Pending, Active) | (Pending, Failed) => true,
            (Active, Expired) | (Active, Cancelled) => true,
            (Pending, Pending | Expired | Cancelled) => false,
            (Active, Pending | Active | Failed) => false,
            (Expired | Cancelled | Failed, _) => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled | SubscriptionStatus::Failed
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payment cycle. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    /// Gateway payment reference; unique across all subscriptions.
    pub external_reference: String,
    pub status: SubscriptionStatus,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub renewal_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Subscription {
    /// Build a new `pending` record.
    pub fn pending(
        user_id: impl Into<String>,
        external_reference: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::uuid::uuidv7(),
            user_id: user_id.into(),
            external_reference: external_reference.into(),
            status: SubscriptionStatus::Pending,
            amount,
            currency: currency.into(),
            started_at: None,
            expires_at: None,
            renewal_attempts: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Whether this record's period covers `now`.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    const ALL: [SubscriptionStatus; 5] = [Pending, Active, Expired, Cancelled, Failed];

    #[test]
    fn only_listed_transitions_are_allowed() {
        let allowed = [(Pending, Active), (Pending, Failed), (Active, Expired), (Active, Cancelled)];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_never_reactivate() {
        for from in [Expired, Cancelled, Failed] {
            assert!(from.is_terminal());
            assert!(!from.can_transition_to(Active));
        }
        assert!(!Pending.is_terminal());
        assert!(!Active.is_terminal());
    }

    #[test]
    fn pending_record_has_no_period() {
        let now = Utc::now();
        let sub = Subscription::pending("u1", "P1", 5000, "NGN", now);
        assert_eq!(sub.status, Pending);
        assert!(!sub.covers(now));
    }
}
