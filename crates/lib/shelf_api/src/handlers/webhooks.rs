//! Payment gateway webhook.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use shelf_core::WebhookOutcome;
use shelf_core::webhook::SIGNATURE_HEADER;
use tracing::info;

use crate::AppState;
use crate::error::AppResult;

/// `POST /webhooks/payments`. The raw body is what the signature covers.
pub async fn payment_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let outcome = state
        .entitlements
        .receive(&body, signature, Utc::now())
        .await?;
    info!(?outcome, "payment webhook processed");
    Ok(Json(outcome))
}
