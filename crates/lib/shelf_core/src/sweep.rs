//! Periodic maintenance passes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::engine::Entitlements;
use crate::error::Result;

/// Counts from one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub reset: usize,
}

impl Entitlements {
    /// Expire lapsed subscriptions, then refill due credit balances. Safe to
    /// run at any frequency.
    pub async fn run_sweeps(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.expire_due(now).await?;
        let reset = self.reset_due(now).await?;
        let report = SweepReport { expired, reset };
        if report != SweepReport::default() {
            info!(expired, reset, "sweep complete");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::config::EntitlementConfig;
    use crate::models::Actor;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn sweep_expires_and_resets() {
        let store = Arc::new(MemoryStore::new());
        let engine = Entitlements::new(store, EntitlementConfig::default());
        let now = Utc::now();

        engine.ensure_user("paid").await.unwrap();
        engine
            .grant_subscription(&Actor::System, "paid", 10, now)
            .await
            .unwrap();
        engine.debit("free", 2, now).await.unwrap();

        let later = now + Duration::days(40);
        let report = engine.run_sweeps(later).await.unwrap();
        // "paid" had its allowance restarted at activation, so both reset.
        assert_eq!(report, SweepReport { expired: 1, reset: 2 });
        assert_eq!(engine.run_sweeps(later).await.unwrap(), SweepReport::default());
        assert!(!engine.get_balance("paid", later).await.unwrap().is_unlimited);
    }
}
