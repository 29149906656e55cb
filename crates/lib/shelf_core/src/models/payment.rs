//! Payment gateway event models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payment status as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GatewayStatus {
    Success,
    Failed,
    Cancelled,
    /// Anything else (`pending`, `reversed`, …). Logged and ignored.
    Other(String),
}

impl GatewayStatus {
    pub fn as_str(&self) -> &str {
        match self {
            GatewayStatus::Success => "success",
            GatewayStatus::Failed => "failed",
            GatewayStatus::Cancelled => "cancelled",
            GatewayStatus::Other(s) => s,
        }
    }
}

impl From<String> for GatewayStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "success" | "successful" | "paid" => GatewayStatus::Success,
            "failed" | "failure" => GatewayStatus::Failed,
            "cancelled" | "canceled" | "abandoned" => GatewayStatus::Cancelled,
            _ => GatewayStatus::Other(s),
        }
    }
}

impl From<GatewayStatus> for String {
    fn from(s: GatewayStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency record keyed by the gateway payment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub reference: String,
    /// Last status observed and fully processed.
    pub status: GatewayStatus,
    pub processed_at: DateTime<Utc>,
}

/// Webhook body, as signed by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Gateway event name, e.g. `charge.success`. Informational only.
    #[serde(default)]
    pub event: Option<String>,
    pub data: WebhookPayment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayment {
    pub reference: String,
    pub status: GatewayStatus,
    /// Required only when the checkout was never recorded locally.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub duration_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_status_normalises_synonyms() {
        assert_eq!(GatewayStatus::from("SUCCESS".to_string()), GatewayStatus::Success);
        assert_eq!(GatewayStatus::from("canceled".to_string()), GatewayStatus::Cancelled);
        assert_eq!(
            GatewayStatus::from("reversed".to_string()),
            GatewayStatus::Other("reversed".into())
        );
    }

    #[test]
    fn envelope_parses_camel_case_payment() {
        let raw = r#"{"event":"charge.success","data":{"reference":"P1","status":"success","userId":"u1","amount":500000,"currency":"NGN"}}"#;
        let env: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.data.reference, "P1");
        assert_eq!(env.data.status, GatewayStatus::Success);
        assert_eq!(env.data.user_id.as_deref(), Some("u1"));
        assert_eq!(env.data.duration_days, None);
    }
}
