//! Checkout and self-service cancellation.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use shelf_core::EntitlementError;
use shelf_core::store::LedgerStore;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{CheckoutBody, SubscriptionView};
use crate::services::gateway::{Checkout, CheckoutRequest};

/// `POST /billing/checkout`: start a payment and record it as pending.
pub async fn checkout_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Option<Json<CheckoutBody>>,
) -> AppResult<Json<Checkout>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let email = body
        .email
        .or_else(|| user.0.email.clone())
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| AppError::Validation("email is required".into()))?;

    let request = CheckoutRequest {
        user_id: user.user_id().to_string(),
        email,
        amount: state.config.subscription_price,
        currency: state.config.subscription_currency.clone(),
        reference: format!("shelf-{}", Uuid::now_v7().simple()),
    };
    let checkout = state.gateway.initialize(&request).await?;

    let created = state
        .entitlements
        .create_pending(
            &request.user_id,
            &checkout.reference,
            request.amount,
            &request.currency,
            Utc::now(),
        )
        .await;
    match created {
        Ok(_) => Ok(Json(checkout)),
        // The confirmation webhook can land first and record the reference.
        Err(EntitlementError::DuplicatePayment(reference)) => {
            let existing = state
                .entitlements
                .store()
                .find_subscription_by_reference(&reference)
                .await
                .map_err(EntitlementError::from)?;
            match existing {
                Some(sub) if sub.user_id == request.user_id => {
                    debug!(%reference, "checkout reference already recorded");
                    Ok(Json(checkout))
                }
                _ => Err(EntitlementError::DuplicatePayment(reference).into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// `POST /billing/subscriptions/{id}/cancel`
pub async fn cancel_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SubscriptionView>> {
    let sub = state
        .entitlements
        .cancel_subscription(&user.actor(), id, Utc::now())
        .await?;
    Ok(Json(sub.into()))
}
