//! Payment webhook processing.
//!
//! Deliveries are at-least-once and unordered. The signature is checked
//! before the body is parsed; idempotency is keyed on the gateway reference
//! and the status observed, and the idempotency record is written last.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Entitlements;
use crate::error::{EntitlementError, Result};
use crate::models::{
    Actor, GatewayStatus, PaymentEvent, Subscription, SubscriptionStatus, WebhookEnvelope,
    WebhookPayment,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-shelf-signature";

/// What a delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WebhookOutcome {
    /// The subscription is now in `status`.
    Applied {
        subscription_id: Uuid,
        status: SubscriptionStatus,
    },
    /// Already processed for this status; nothing changed.
    Duplicate,
    /// Acknowledged without changing anything.
    Ignored { reason: String },
}

fn mac(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret).map_err(|_| EntitlementError::InvalidSignature)
}

/// Hex HMAC-SHA256 of `payload`, as a gateway would send it.
pub fn sign(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature header. An empty secret rejects
/// every delivery.
pub fn verify_signature(secret: &[u8], payload: &[u8], header: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(EntitlementError::InvalidSignature);
    }
    let header = header.trim();
    let header = header.strip_prefix("sha256=").unwrap_or(header);
    let expected = hex::decode(header).map_err(|_| EntitlementError::InvalidSignature)?;

    let mut mac = mac(secret)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| EntitlementError::InvalidSignature)
}

impl Entitlements {
    /// Verify, deduplicate and apply one webhook delivery.
    pub async fn receive(
        &self,
        raw: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let signature = signature.ok_or(EntitlementError::InvalidSignature)?;
        verify_signature(&self.config.webhook_secret, raw, signature)?;

        let envelope: WebhookEnvelope = serde_json::from_slice(raw)
            .map_err(|e| EntitlementError::InvalidPayload(e.to_string()))?;
        let payment = envelope.data;
        if payment.reference.trim().is_empty() {
            return Err(EntitlementError::InvalidPayload("empty payment reference".into()));
        }

        if let GatewayStatus::Other(status) = &payment.status {
            info!(
                reference = %payment.reference,
                status = %status,
                event = envelope.event.as_deref().unwrap_or("-"),
                "ignoring payment status"
            );
            return Ok(WebhookOutcome::Ignored {
                reason: format!("unhandled status {status}"),
            });
        }

        if let Some(seen) = self.store.get_payment_event(&payment.reference).await?
            && seen.status == payment.status
        {
            debug!(reference = %payment.reference, status = %payment.status, "duplicate delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = self.apply_payment(&payment, now).await?;

        self.store
            .put_payment_event(&PaymentEvent {
                reference: payment.reference.clone(),
                status: payment.status.clone(),
                processed_at: now,
            })
            .await?;
        Ok(outcome)
    }

    async fn apply_payment(
        &self,
        payment: &WebhookPayment,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let existing = self
            .store
            .find_subscription_by_reference(&payment.reference)
            .await?;

        match payment.status {
            GatewayStatus::Success => {
                let sub = match existing {
                    Some(sub) => sub,
                    None => self.pending_from_webhook(payment, now).await?,
                };
                if sub.status == SubscriptionStatus::Active {
                    debug!(reference = %payment.reference, "subscription already active");
                    self.repair_activation(&sub, now).await?;
                    return Ok(applied(&sub));
                }
                let amount = if payment.amount > 0 { payment.amount } else { sub.amount };
                let currency = payment.currency.as_deref().unwrap_or(&sub.currency);
                let days = payment
                    .duration_days
                    .unwrap_or(self.config.default_subscription_days);
                let result = self.activate(sub.id, amount, currency, days, now).await;
                acknowledge(&payment.reference, result)
            }
            GatewayStatus::Failed => {
                let Some(sub) = existing else {
                    return Ok(unknown_reference(&payment.reference));
                };
                acknowledge(&payment.reference, self.fail(sub.id, now).await)
            }
            GatewayStatus::Cancelled => {
                let Some(sub) = existing else {
                    return Ok(unknown_reference(&payment.reference));
                };
                let result = if sub.status == SubscriptionStatus::Pending {
                    self.fail(sub.id, now).await
                } else {
                    self.cancel(sub.id, &Actor::System, now).await
                };
                acknowledge(&payment.reference, result)
            }
            GatewayStatus::Other(ref status) => Ok(WebhookOutcome::Ignored {
                reason: format!("unhandled status {status}"),
            }),
        }
    }

    /// Success arrived before the checkout was recorded locally.
    async fn pending_from_webhook(
        &self,
        payment: &WebhookPayment,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let user_id = payment.user_id.as_deref().ok_or_else(|| {
            EntitlementError::InvalidPayload(format!(
                "unknown reference {} and no userId",
                payment.reference
            ))
        })?;
        let currency = payment.currency.as_deref().unwrap_or_default();
        match self
            .create_pending(user_id, &payment.reference, payment.amount, currency, now)
            .await
        {
            Ok(sub) => Ok(sub),
            Err(EntitlementError::DuplicatePayment(_)) => self
                .store
                .find_subscription_by_reference(&payment.reference)
                .await?
                .ok_or_else(|| EntitlementError::NotFound(payment.reference.clone())),
            Err(e) => Err(e),
        }
    }
}

fn applied(sub: &Subscription) -> WebhookOutcome {
    WebhookOutcome::Applied {
        subscription_id: sub.id,
        status: sub.status,
    }
}

fn unknown_reference(reference: &str) -> WebhookOutcome {
    warn!(reference, "payment event for unknown reference");
    WebhookOutcome::Ignored {
        reason: format!("unknown reference {reference}"),
    }
}

/// Stale or out-of-order events are acknowledged so the gateway stops
/// redelivering them.
fn acknowledge(reference: &str, result: Result<Subscription>) -> Result<WebhookOutcome> {
    match result {
        Ok(sub) => Ok(applied(&sub)),
        Err(EntitlementError::InvalidTransition { from, to }) => {
            warn!(reference, %from, %to, "payment event rejected by state machine");
            Ok(WebhookOutcome::Ignored {
                reason: format!("cannot move from {from} to {to}"),
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::EntitlementConfig;
    use crate::models::{AuditAction, SubscriptionMirror};
    use crate::store::LedgerStore;
    use crate::store::memory::MemoryStore;

    const SECRET: &[u8] = b"whsec_test";

    fn engine() -> (Arc<MemoryStore>, Entitlements) {
        let store = Arc::new(MemoryStore::new());
        let config = EntitlementConfig::default().with_webhook_secret(SECRET);
        (store.clone(), Entitlements::new(store, config))
    }

    fn body(reference: &str, status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": "charge.update",
            "data": {
                "reference": reference,
                "status": status,
                "userId": "u1",
                "amount": 500000,
                "currency": "NGN"
            }
        }))
        .unwrap()
    }

    async fn deliver(engine: &Entitlements, raw: &[u8]) -> Result<WebhookOutcome> {
        let sig = sign(SECRET, raw).unwrap();
        engine.receive(raw, Some(&sig), Utc::now()).await
    }

    fn count(store: &MemoryStore, action: AuditAction) -> usize {
        store
            .audit_entries()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }

    #[test]
    fn signature_round_trip_and_tamper() {
        let sig = sign(SECRET, b"payload").unwrap();
        assert!(verify_signature(SECRET, b"payload", &sig).is_ok());
        assert!(verify_signature(SECRET, b"payload", &format!("sha256={sig}")).is_ok());
        assert!(verify_signature(SECRET, b"payl0ad", &sig).is_err());
        assert!(verify_signature(SECRET, b"payload", "not-hex").is_err());
        assert!(verify_signature(b"", b"payload", &sig).is_err());
    }

    #[tokio::test]
    async fn bad_signature_has_no_side_effects() {
        let (store, engine) = engine();
        let raw = body("P1", "success");
        let err = engine
            .receive(&raw, Some("deadbeef"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidSignature));
        assert!(store.get_payment_event("P1").await.unwrap().is_none());
        assert!(store.subscriptions_for("u1").is_empty());

        let missing = engine.receive(&raw, None, Utc::now()).await.unwrap_err();
        assert!(matches!(missing, EntitlementError::InvalidSignature));
    }

    #[tokio::test]
    async fn replayed_success_activates_once() {
        let (store, engine) = engine();
        let now = Utc::now();
        engine.create_pending("u1", "P1", 500000, "NGN", now).await.unwrap();

        let raw = body("P1", "success");
        let first = deliver(&engine, &raw).await.unwrap();
        assert!(matches!(
            first,
            WebhookOutcome::Applied {
                status: SubscriptionStatus::Active,
                ..
            }
        ));
        assert_eq!(deliver(&engine, &raw).await.unwrap(), WebhookOutcome::Duplicate);

        assert_eq!(count(&store, AuditAction::SubscriptionActivated), 1);
        assert!(engine.get_balance("u1", now).await.unwrap().is_unlimited);
    }

    #[tokio::test]
    async fn success_before_checkout_creates_the_record() {
        let (store, engine) = engine();
        deliver(&engine, &body("P9", "success")).await.unwrap();
        let subs = store.subscriptions_for("u1");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].external_reference, "P9");
        assert_eq!(subs[0].status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn unknown_reference_without_user_is_rejected() {
        let (store, engine) = engine();
        let raw = serde_json::to_vec(&json!({
            "data": { "reference": "P2", "status": "success" }
        }))
        .unwrap();
        assert!(matches!(
            deliver(&engine, &raw).await,
            Err(EntitlementError::InvalidPayload(_))
        ));
        assert!(store.get_payment_event("P2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_for_already_active_record_is_applied_quietly() {
        let (store, engine) = engine();
        let now = Utc::now();
        let sub = engine.create_pending("u1", "P1", 500000, "NGN", now).await.unwrap();
        engine.activate(sub.id, 500000, "NGN", 30, now).await.unwrap();

        let outcome = deliver(&engine, &body("P1", "success")).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                subscription_id: sub.id,
                status: SubscriptionStatus::Active
            }
        );
        assert_eq!(count(&store, AuditAction::SubscriptionActivated), 1);
    }

    #[tokio::test]
    async fn redelivery_repairs_an_interrupted_activation() {
        let (store, engine) = engine();
        let now = Utc::now();
        let mut sub = engine.create_pending("u1", "P1", 500000, "NGN", now).await.unwrap();
        engine.debit("u1", 4, now).await.unwrap();

        // Only the conditioned write landed; mirror, allowance and audit did not.
        sub.status = SubscriptionStatus::Active;
        sub.started_at = Some(now);
        sub.expires_at = Some(now + chrono::Duration::days(30));
        assert!(store.update_subscription(&sub).await.unwrap().applied());
        assert_eq!(
            engine.get_user("u1").await.unwrap().subscription_status,
            SubscriptionMirror::Inactive
        );

        let outcome = deliver(&engine, &body("P1", "success")).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied { .. }));

        let user = engine.get_user("u1").await.unwrap();
        assert_eq!(user.subscription_status, SubscriptionMirror::Active);
        assert_eq!(user.next_billing_at, sub.expires_at);
        assert_eq!(count(&store, AuditAction::SubscriptionActivated), 1);
        assert_eq!(store.get_balance("u1").await.unwrap().unwrap().credits, 5);

        assert_eq!(
            deliver(&engine, &body("P1", "success")).await.unwrap(),
            WebhookOutcome::Duplicate
        );
        assert_eq!(count(&store, AuditAction::SubscriptionActivated), 1);
    }

    #[tokio::test]
    async fn failed_and_cancelled_route_by_state() {
        let (_, engine) = engine();
        let now = Utc::now();
        let a = engine.create_pending("u1", "PA", 1, "NGN", now).await.unwrap();
        let b = engine.create_pending("u1", "PB", 1, "NGN", now).await.unwrap();
        let c = engine.create_pending("u1", "PC", 1, "NGN", now).await.unwrap();
        engine.activate(c.id, 1, "NGN", 30, now).await.unwrap();

        deliver(&engine, &body("PA", "failed")).await.unwrap();
        deliver(&engine, &body("PB", "cancelled")).await.unwrap();
        deliver(&engine, &body("PC", "cancelled")).await.unwrap();

        assert_eq!(engine.get_subscription(a.id).await.unwrap().status, SubscriptionStatus::Failed);
        assert_eq!(engine.get_subscription(b.id).await.unwrap().status, SubscriptionStatus::Failed);
        assert_eq!(
            engine.get_subscription(c.id).await.unwrap().status,
            SubscriptionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn out_of_order_success_is_acknowledged_without_mutation() {
        let (store, engine) = engine();
        let now = Utc::now();
        let sub = engine.create_pending("u1", "P1", 1, "NGN", now).await.unwrap();
        deliver(&engine, &body("P1", "failed")).await.unwrap();

        let outcome = deliver(&engine, &body("P1", "success")).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(
            engine.get_subscription(sub.id).await.unwrap().status,
            SubscriptionStatus::Failed
        );
        assert_eq!(count(&store, AuditAction::SubscriptionActivated), 0);
    }

    #[tokio::test]
    async fn unrecognised_status_is_ignored_and_not_recorded() {
        let (store, engine) = engine();
        let outcome = deliver(&engine, &body("P1", "reversed")).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert!(store.get_payment_event("P1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_body_with_valid_signature_is_invalid_payload() {
        let (_, engine) = engine();
        assert!(matches!(
            deliver(&engine, b"{not json").await,
            Err(EntitlementError::InvalidPayload(_))
        ));
    }
}
