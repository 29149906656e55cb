//! Outbound payment gateway calls.
//!
//! Only checkout initialization goes outbound; confirmations come back
//! through the signed webhook.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Gateway rejected request: {0}")]
    Rejected(String),
}

/// What the gateway needs to start a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub email: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    /// Our reference; the webhook echoes it back.
    pub reference: String,
}

/// Where to send the user to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub checkout_url: String,
    pub reference: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(&self, request: &CheckoutRequest) -> Result<Checkout, GatewayError>;
}

#[derive(Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    amount: i64,
    currency: &'a str,
    reference: &'a str,
    metadata: InitializeMetadata<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeMetadata<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct InitializeResponse {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<InitializeData>,
}

#[derive(Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

/// Gateway speaking the `POST {base}/transaction/initialize` JSON API.
#[derive(Debug, Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    endpoint: Url,
    secret: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let endpoint = base.join("transaction/initialize")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            secret: secret.to_string(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn initialize(&self, request: &CheckoutRequest) -> Result<Checkout, GatewayError> {
        debug!(reference = %request.reference, "initializing checkout");
        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.secret)
            .json(&InitializeBody {
                email: &request.email,
                amount: request.amount,
                currency: &request.currency,
                reference: &request.reference,
                metadata: InitializeMetadata {
                    user_id: &request.user_id,
                },
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(GatewayError::Rejected(format!("{status} {body}")));
        }

        let parsed: InitializeResponse = resp.json().await?;
        match parsed.data {
            Some(data) if parsed.status => Ok(Checkout {
                checkout_url: data.authorization_url,
                reference: data.reference,
            }),
            _ => Err(GatewayError::Rejected(
                parsed.message.unwrap_or_else(|| "no checkout data".into()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path() {
        let gw = HttpPaymentGateway::new("https://pay.example.com/v2", "sk", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            gw.endpoint().as_str(),
            "https://pay.example.com/v2/transaction/initialize"
        );
    }

    #[test]
    fn bad_base_url_is_rejected() {
        assert!(matches!(
            HttpPaymentGateway::new("not a url", "sk", Duration::from_secs(1)),
            Err(GatewayError::InvalidUrl(_))
        ));
    }
}
