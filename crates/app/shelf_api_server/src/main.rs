//! Shelf entitlement API server.
//!
//! Serves the HTTP API over a Postgres-backed ledger and runs the periodic
//! expiry and credit-reset sweeps until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use shelf_api::config::ApiConfig;
use shelf_api::services::gateway::HttpPaymentGateway;
use shelf_core::Entitlements;
use shelf_core::store::postgres::PgLedgerStore;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// CLI arguments; anything not listed here comes from the environment.
#[derive(Parser, Debug)]
#[command(name = "shelf_api_server", about = "Shelf entitlement API server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3100")]
    bind_addr: String,

    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/shelf"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 10)]
    max_connections: u32,

    /// Seconds between expiry/reset sweeps (0 disables the background sweep).
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 300)]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,shelf_api=debug,shelf_core=debug")
            }),
        )
        .init();

    let args = Args::parse();
    let config = ApiConfig {
        bind_addr: args.bind_addr,
        database_url: args.database_url,
        sweep_interval_secs: args.sweep_interval_secs,
        ..ApiConfig::from_env()
    };

    info!(bind_addr = %config.bind_addr, "starting shelf_api_server");

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database_url)
        .await?;

    info!("running database migrations");
    shelf_api::migrate(&pool).await?;

    let store = Arc::new(PgLedgerStore::new(pool));
    let entitlements = Entitlements::new(store, config.entitlement_config());
    let gateway = HttpPaymentGateway::new(
        &config.gateway_url,
        &config.gateway_secret,
        Duration::from_secs(config.gateway_timeout_secs),
    )?;

    let state = shelf_api::AppState {
        entitlements: entitlements.clone(),
        config: config.clone(),
        gateway: Arc::new(gateway),
    };
    let app = shelf_api::router(state);

    let shutdown = CancellationToken::new();
    let sweeper = (config.sweep_interval_secs > 0).then(|| {
        tokio::spawn(run_sweeper(
            entitlements,
            Duration::from_secs(config.sweep_interval_secs),
            shutdown.clone(),
        ))
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let api_result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                    _ = shutdown.cancelled() => {}
                }
            }
        })
        .await;

    shutdown.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }

    api_result?;
    Ok(())
}

/// Run `run_sweeps` every `period` until cancelled.
async fn run_sweeper(entitlements: Entitlements, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "sweeper started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = entitlements.run_sweeps(chrono::Utc::now()).await {
                    error!("sweep failed: {e}");
                }
            }
        }
    }
    info!("sweeper stopped");
}
