//! Account domain models.
//!
//! The identity provider owns who a user is; this core owns the entitlement
//! fields hanging off that identity (role, lock state, subscription mirror).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User role matching the `user_role` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Subscription status mirrored onto the user record for cheap reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_mirror", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMirror {
    Active,
    Inactive,
}

/// Entitlement view of a user, keyed by the external identity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserAccount {
    pub user_id: String,
    pub role: Role,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub subscription_status: SubscriptionMirror,
    pub next_billing_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every successful write.
    pub version: i64,
}

impl UserAccount {
    /// A freshly seen user: plain role, unlocked, no subscription.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
            is_locked: false,
            lock_reason: None,
            locked_at: None,
            subscription_status: SubscriptionMirror::Inactive,
            next_billing_at: None,
            version: 0,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Who is performing an operation. Always passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Actor {
    /// Scheduled sweeps, webhooks and operator tooling.
    System,
    /// An authenticated user, by external identity id.
    User(String),
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Actor::User(id.into())
    }

    /// Identity id, or `None` for the system actor.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::System => None,
            Actor::User(id) => Some(id),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::User(id) => f.write_str(id),
        }
    }
}
