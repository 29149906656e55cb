//! PostgreSQL ledger store.
//!
//! Conditioned writes are single `UPDATE … WHERE <key> AND version = $n`
//! statements; zero affected rows means someone else won the race. The
//! one-active-subscription rule is a partial unique index, so a violating
//! write surfaces as a unique-constraint error and is reported as
//! [`Cas::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgQueryResult;
use uuid::Uuid;

use super::{Cas, Inserted, LedgerStore, StoreResult};
use crate::models::{
    AuditAction, AuditLogEntry, CreditBalance, DownloadRecord, DownloadWindow, GatewayStatus,
    PaymentEvent, Subscription, UserAccount,
};

const USER_COLUMNS: &str = "user_id, role, is_locked, lock_reason, locked_at, \
     subscription_status, next_billing_at, version";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, external_reference, status, amount, currency, \
     started_at, expires_at, renewal_attempts, created_at, updated_at, version";

/// Ledger store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn cas(result: PgQueryResult) -> Cas {
    if result.rows_affected() == 1 {
        Cas::Applied
    } else {
        Cas::Conflict
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        let row = sqlx::query_as::<_, UserAccount>(&format!(
            "SELECT {USER_COLUMNS} FROM user_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_user(&self, user: &UserAccount) -> StoreResult<Inserted<UserAccount>> {
        let created = sqlx::query_as::<_, UserAccount>(&format!(
            "INSERT INTO user_accounts ({USER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (user_id) DO NOTHING \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.user_id)
        .bind(user.role)
        .bind(user.is_locked)
        .bind(&user.lock_reason)
        .bind(user.locked_at)
        .bind(user.subscription_status)
        .bind(user.next_billing_at)
        .bind(user.version)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(row) => Ok(Inserted::Created(row)),
            None => {
                let existing = self.get_user(&user.user_id).await?.ok_or_else(|| {
                    super::StoreError::Corrupt(format!("user {} vanished", user.user_id))
                })?;
                Ok(Inserted::Existing(existing))
            }
        }
    }

    async fn update_user(&self, user: &UserAccount) -> StoreResult<Cas> {
        let result = sqlx::query(
            "UPDATE user_accounts SET role = $2, is_locked = $3, lock_reason = $4, \
             locked_at = $5, subscription_status = $6, next_billing_at = $7, \
             version = version + 1 \
             WHERE user_id = $1 AND version = $8",
        )
        .bind(&user.user_id)
        .bind(user.role)
        .bind(user.is_locked)
        .bind(&user.lock_reason)
        .bind(user.locked_at)
        .bind(user.subscription_status)
        .bind(user.next_billing_at)
        .bind(user.version)
        .execute(&self.pool)
        .await?;
        Ok(cas(result))
    }

    async fn users_with_lapsed_mirror(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<UserAccount>> {
        let rows = sqlx::query_as::<_, UserAccount>(&format!(
            "SELECT {USER_COLUMNS} FROM user_accounts \
             WHERE subscription_status = 'active' \
               AND (next_billing_at IS NULL OR next_billing_at <= $1) \
             ORDER BY next_billing_at NULLS FIRST \
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_subscription(
        &self,
        sub: &Subscription,
    ) -> StoreResult<Inserted<Subscription>> {
        let created = sqlx::query_as::<_, Subscription>(&format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (external_reference) DO NOTHING \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(sub.id)
        .bind(&sub.user_id)
        .bind(&sub.external_reference)
        .bind(sub.status)
        .bind(sub.amount)
        .bind(&sub.currency)
        .bind(sub.started_at)
        .bind(sub.expires_at)
        .bind(sub.renewal_attempts)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .bind(sub.version)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(row) => Ok(Inserted::Created(row)),
            None => {
                let existing = self
                    .find_subscription_by_reference(&sub.external_reference)
                    .await?
                    .ok_or_else(|| {
                        super::StoreError::Corrupt(format!(
                            "subscription {} vanished",
                            sub.external_reference
                        ))
                    })?;
                Ok(Inserted::Existing(existing))
            }
        }
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_subscription_by_reference(
        &self,
        reference: &str,
    ) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn live_subscriptions(&self, user_id: &str) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND status IN ('active', 'cancelled')"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn active_subscriptions_expiring(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status = 'active' AND expires_at <= $1 \
             ORDER BY expires_at \
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<Cas> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $2, amount = $3, currency = $4, \
             started_at = $5, expires_at = $6, renewal_attempts = $7, updated_at = $8, \
             version = version + 1 \
             WHERE id = $1 AND version = $9",
        )
        .bind(sub.id)
        .bind(sub.status)
        .bind(sub.amount)
        .bind(&sub.currency)
        .bind(sub.started_at)
        .bind(sub.expires_at)
        .bind(sub.renewal_attempts)
        .bind(sub.updated_at)
        .bind(sub.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(cas(r)),
            // Partial unique index: another subscription became active first.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(Cas::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_balance(&self, user_id: &str) -> StoreResult<Option<CreditBalance>> {
        let row = sqlx::query_as::<_, CreditBalance>(
            "SELECT user_id, credits, resets_at, version FROM credit_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_balance(
        &self,
        balance: &CreditBalance,
    ) -> StoreResult<Inserted<CreditBalance>> {
        let created = sqlx::query_as::<_, CreditBalance>(
            "INSERT INTO credit_balances (user_id, credits, resets_at, version) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO NOTHING \
             RETURNING user_id, credits, resets_at, version",
        )
        .bind(&balance.user_id)
        .bind(balance.credits)
        .bind(balance.resets_at)
        .bind(balance.version)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(row) => Ok(Inserted::Created(row)),
            None => {
                let existing = self.get_balance(&balance.user_id).await?.ok_or_else(|| {
                    super::StoreError::Corrupt(format!("balance {} vanished", balance.user_id))
                })?;
                Ok(Inserted::Existing(existing))
            }
        }
    }

    async fn update_balance(&self, balance: &CreditBalance) -> StoreResult<Cas> {
        let result = sqlx::query(
            "UPDATE credit_balances SET credits = $2, resets_at = $3, version = version + 1 \
             WHERE user_id = $1 AND version = $4",
        )
        .bind(&balance.user_id)
        .bind(balance.credits)
        .bind(balance.resets_at)
        .bind(balance.version)
        .execute(&self.pool)
        .await?;
        Ok(cas(result))
    }

    async fn balances_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<CreditBalance>> {
        let rows = sqlx::query_as::<_, CreditBalance>(
            "SELECT user_id, credits, resets_at, version FROM credit_balances \
             WHERE resets_at <= $1 ORDER BY resets_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_download_window(&self, user_id: &str) -> StoreResult<Option<DownloadWindow>> {
        let row = sqlx::query_as::<_, DownloadWindow>(
            "SELECT user_id, window_start, count, version FROM download_windows \
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_download_window(
        &self,
        window: &DownloadWindow,
    ) -> StoreResult<Inserted<DownloadWindow>> {
        let created = sqlx::query_as::<_, DownloadWindow>(
            "INSERT INTO download_windows (user_id, window_start, count, version) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO NOTHING \
             RETURNING user_id, window_start, count, version",
        )
        .bind(&window.user_id)
        .bind(window.window_start)
        .bind(window.count)
        .bind(window.version)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(row) => Ok(Inserted::Created(row)),
            None => {
                let existing = self
                    .get_download_window(&window.user_id)
                    .await?
                    .ok_or_else(|| {
                        super::StoreError::Corrupt(format!(
                            "download window {} vanished",
                            window.user_id
                        ))
                    })?;
                Ok(Inserted::Existing(existing))
            }
        }
    }

    async fn update_download_window(&self, window: &DownloadWindow) -> StoreResult<Cas> {
        let result = sqlx::query(
            "UPDATE download_windows SET window_start = $2, count = $3, version = version + 1 \
             WHERE user_id = $1 AND version = $4",
        )
        .bind(&window.user_id)
        .bind(window.window_start)
        .bind(window.count)
        .bind(window.version)
        .execute(&self.pool)
        .await?;
        Ok(cas(result))
    }

    async fn append_download(&self, record: &DownloadRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO download_records (id, user_id, resource_id, unlimited, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.resource_id)
        .bind(record.unlimited)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment_event(&self, reference: &str) -> StoreResult<Option<PaymentEvent>> {
        let row = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(
            "SELECT reference, status, processed_at FROM payment_events WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(reference, status, processed_at)| PaymentEvent {
            reference,
            status: GatewayStatus::from(status),
            processed_at,
        }))
    }

    async fn put_payment_event(&self, event: &PaymentEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO payment_events (reference, status, processed_at) VALUES ($1, $2, $3) \
             ON CONFLICT (reference) DO UPDATE \
             SET status = EXCLUDED.status, processed_at = EXCLUDED.processed_at",
        )
        .bind(&event.reference)
        .bind(event.status.as_str())
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, action, actor_user_id, target_user_id, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.id)
        .bind(entry.action)
        .bind(&entry.actor_user_id)
        .bind(&entry.target_user_id)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_recorded(
        &self,
        action: AuditAction,
        subscription_id: Uuid,
    ) -> StoreResult<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM audit_log \
             WHERE action = $1 AND details->>'subscriptionId' = $2)",
        )
        .bind(action)
        .bind(subscription_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    //! Run against a real database only when `DATABASE_URL` is set.

    use super::*;
    use crate::models::{Subscription, SubscriptionStatus};

    async fn store() -> Option<PgLedgerStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        crate::migrate::migrate(&pool).await.ok()?;
        Some(PgLedgerStore::new(pool))
    }

    #[tokio::test]
    async fn conditioned_user_update_detects_races() {
        let Some(store) = store().await else {
            return;
        };
        let id = format!("pg-test-{}", Uuid::new_v4());
        let user = store
            .insert_user(&UserAccount::new(&id))
            .await
            .unwrap()
            .into_inner();

        let mut locked = user.clone();
        locked.is_locked = true;
        assert_eq!(store.update_user(&locked).await.unwrap(), Cas::Applied);
        assert_eq!(store.update_user(&locked).await.unwrap(), Cas::Conflict);
    }

    #[tokio::test]
    async fn partial_index_rejects_second_active() {
        let Some(store) = store().await else {
            return;
        };
        let user = format!("pg-test-{}", Uuid::new_v4());
        let now = Utc::now();
        let mut subs = Vec::new();
        for n in 0..2 {
            let sub = Subscription::pending(&user, format!("{user}-{n}"), 100, "NGN", now);
            subs.push(store.insert_subscription(&sub).await.unwrap().into_inner());
        }
        for sub in &mut subs {
            sub.status = SubscriptionStatus::Active;
        }
        assert_eq!(store.update_subscription(&subs[0]).await.unwrap(), Cas::Applied);
        assert_eq!(store.update_subscription(&subs[1]).await.unwrap(), Cas::Conflict);
    }
}
