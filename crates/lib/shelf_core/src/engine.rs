//! The entitlement engine handle.
//!
//! [`Entitlements`] owns the store, configuration and audit recorder. Its
//! operations are spread over the component modules (`accounts`,
//! `subscriptions`, `ledger`, `webhook`, `gate`, `sweep`) as `impl` blocks.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::audit::AuditRecorder;
use crate::config::EntitlementConfig;
use crate::error::EntitlementError;
use crate::store::LedgerStore;

/// Shared entitlement engine. Cheap to clone.
#[derive(Clone)]
pub struct Entitlements {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) config: Arc<EntitlementConfig>,
    pub(crate) audit: AuditRecorder,
}

impl Entitlements {
    pub fn new(store: Arc<dyn LedgerStore>, config: EntitlementConfig) -> Self {
        let audit = AuditRecorder::new(store.clone());
        Self {
            store,
            config: Arc::new(config),
            audit,
        }
    }

    pub fn config(&self) -> &EntitlementConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Sleep before retrying a conditioned write that lost a race.
    pub(crate) async fn backoff(&self, what: &str, attempt: u32) {
        let base = self.config.retry.base_delay;
        let ceiling = base.saturating_mul(attempt).as_micros() as u64;
        let jitter = if ceiling == 0 {
            0
        } else {
            rand::rng().random_range(0..=ceiling)
        };
        debug!(what, attempt, jitter_us = jitter, "conditioned write conflicted, retrying");
        tokio::time::sleep(std::time::Duration::from_micros(jitter)).await;
    }

    pub(crate) fn exhausted(&self, what: impl Into<String>) -> EntitlementError {
        let what = what.into();
        EntitlementError::Conflict(format!(
            "{what}: gave up after {} attempts",
            self.config.retry.max_attempts
        ))
    }
}

impl std::fmt::Debug for Entitlements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entitlements")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
