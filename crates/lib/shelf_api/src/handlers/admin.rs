//! Administrative handlers. Mounted behind `require_admin`; the core checks
//! the actor's role again.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{GrantRequest, LockRequest, RoleRequest, SubscriptionView, UserView};

/// `POST /admin/users/{id}/lock`
pub async fn lock_handler(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedUser>,
    Path(user_id): Path<String>,
    Json(body): Json<LockRequest>,
) -> AppResult<Json<UserView>> {
    let user = state
        .entitlements
        .lock_account(&admin.actor(), &user_id, &body.reason, Utc::now())
        .await?;
    Ok(Json(user.into()))
}

/// `POST /admin/users/{id}/unlock`
pub async fn unlock_handler(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedUser>,
    Path(user_id): Path<String>,
) -> AppResult<Json<UserView>> {
    let user = state
        .entitlements
        .unlock_account(&admin.actor(), &user_id, Utc::now())
        .await?;
    Ok(Json(user.into()))
}

/// `POST /admin/users/{id}/grant`
pub async fn grant_handler(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedUser>,
    Path(user_id): Path<String>,
    body: Option<Json<GrantRequest>>,
) -> AppResult<Json<SubscriptionView>> {
    let days = body
        .and_then(|Json(b)| b.duration_days)
        .unwrap_or(state.config.subscription_days);
    let sub = state
        .entitlements
        .grant_subscription(&admin.actor(), &user_id, days, Utc::now())
        .await?;
    Ok(Json(sub.into()))
}

/// `PATCH /admin/users/{id}/role`
pub async fn role_handler(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedUser>,
    Path(user_id): Path<String>,
    Json(body): Json<RoleRequest>,
) -> AppResult<Json<UserView>> {
    let user = state
        .entitlements
        .set_role(&admin.actor(), &user_id, body.role, Utc::now())
        .await?;
    Ok(Json(user.into()))
}
