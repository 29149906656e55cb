//! Audit recorder.
//!
//! Appends one immutable entry per state-changing action. Called only after
//! the change it describes has committed; a failed append is logged and
//! dropped so it can never unwind that change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::{Actor, AuditAction, AuditLogEntry};
use crate::store::LedgerStore;
use crate::uuid::uuidv7;

/// Best-effort audit writer.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn LedgerStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append an entry. Never fails; returns whether the write landed.
    pub async fn record(
        &self,
        action: AuditAction,
        actor: &Actor,
        target_user_id: Option<&str>,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> bool {
        let entry = AuditLogEntry {
            id: uuidv7(),
            action,
            actor_user_id: actor.user_id().map(str::to_string),
            target_user_id: target_user_id.map(str::to_string),
            details,
            created_at: now,
        };

        match self.store.append_audit(&entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    action = %action,
                    actor = %actor,
                    target = target_user_id.unwrap_or("-"),
                    "failed to record audit entry: {e}"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn records_actor_and_target() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AuditRecorder::new(store.clone());

        let ok = recorder
            .record(
                AuditAction::AccountLocked,
                &Actor::user("admin-1"),
                Some("u1"),
                Some(serde_json::json!({"reason": "chargeback"})),
                Utc::now(),
            )
            .await;

        assert!(ok);
        let entries = store.audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::AccountLocked);
        assert_eq!(entries[0].actor_user_id.as_deref(), Some("admin-1"));
        assert_eq!(entries[0].target_user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn failed_append_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.set_audit_failure(true);
        let recorder = AuditRecorder::new(store.clone());

        let ok = recorder
            .record(AuditAction::CreditsReset, &Actor::System, None, None, Utc::now())
            .await;

        assert!(!ok);
        assert!(store.audit_entries().is_empty());
    }
}
