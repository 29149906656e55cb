//! # shelf_api
//!
//! HTTP API library for Shelf entitlements.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, patch, post};
use shelf_core::Entitlements;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{admin, billing, entitlements, health, webhooks};
use crate::services::gateway::PaymentGateway;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Entitlement engine over the configured store.
    pub entitlements: Entitlements,
    /// API configuration.
    pub config: ApiConfig,
    /// Outbound payment initialization.
    pub gateway: Arc<dyn PaymentGateway>,
}

/// Run embedded database migrations.
///
/// Delegates to `shelf_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    shelf_core::migrate::migrate(pool).await
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // No bearer token: liveness, and the gateway authenticates by HMAC.
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/payments", post(webhooks::payment_webhook_handler));

    let protected = Router::new()
        .route("/entitlements/check", post(entitlements::check_handler))
        .route("/entitlements/balance", get(entitlements::balance_handler))
        .route("/billing/checkout", post(billing::checkout_handler))
        .route(
            "/billing/subscriptions/{id}/cancel",
            post(billing::cancel_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    // The last layer added runs first: authenticate, then check the role.
    let admin_routes = Router::new()
        .route("/admin/users/{id}/lock", post(admin::lock_handler))
        .route("/admin/users/{id}/unlock", post(admin::unlock_handler))
        .route("/admin/users/{id}/grant", post(admin::grant_handler))
        .route("/admin/users/{id}/role", patch(admin::role_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_admin,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
