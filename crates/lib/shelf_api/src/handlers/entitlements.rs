//! Download gate and balance handlers.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use shelf_core::models::BalanceView;
use shelf_core::Decision;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::CheckRequest;

/// `POST /entitlements/check`: decide and consume for one download.
pub async fn check_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<CheckRequest>,
) -> AppResult<Json<Decision>> {
    if body.resource_id.trim().is_empty() {
        return Err(AppError::Validation("resourceId is required".into()));
    }
    let decision = state
        .entitlements
        .check_and_consume(user.user_id(), &body.resource_id, Utc::now())
        .await?;
    Ok(Json(decision))
}

/// `GET /entitlements/balance`
pub async fn balance_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> AppResult<Json<BalanceView>> {
    let view = state
        .entitlements
        .get_balance(user.user_id(), Utc::now())
        .await?;
    Ok(Json(view))
}
