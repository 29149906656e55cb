mod cli;
mod error;
mod logging;

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use shelf_api::config::ApiConfig;
use shelf_core::Entitlements;
use shelf_core::models::Actor;
use shelf_core::store::postgres::PgLedgerStore;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use cli::{Cli, Commands, DbArgs};
pub use error::{Error, Result};

fn main() {
    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("shelf {}", shelf_core::version());
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli.command))
}

async fn connect(db: &DbArgs) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&db.database_url)
        .await?;
    Ok(pool)
}

async fn engine(db: &DbArgs) -> Result<Entitlements> {
    let pool = connect(db).await?;
    let config = ApiConfig::from_env();
    Ok(Entitlements::new(
        Arc::new(PgLedgerStore::new(pool)),
        config.entitlement_config(),
    ))
}

async fn execute(command: Commands) -> Result<()> {
    let now = Utc::now();
    let actor = Actor::System;
    match command {
        Commands::Version => {}
        Commands::Migrate { db } => {
            let pool = connect(&db).await?;
            shelf_core::migrate::migrate(&pool).await?;
            log::info!("migrations applied");
        }
        Commands::Sweep { db } => {
            let report = engine(&db).await?.run_sweeps(now).await?;
            log::info!(
                "expired {} subscription(s), reset {} balance(s)",
                report.expired,
                report.reset
            );
        }
        Commands::Balance { db, user_id } => {
            let entitlements = engine(&db).await?;
            entitlements.get_user(&user_id).await?;
            let balance = entitlements.get_balance(&user_id, now).await?;
            println!("{}", serde_json::to_string_pretty(&balance)?);
        }
        Commands::Refund {
            db,
            user_id,
            amount,
        } => {
            let entitlements = engine(&db).await?;
            entitlements.get_user(&user_id).await?;
            let credits = entitlements.refund(&user_id, amount, now).await?;
            log::info!("{user_id} now has {credits} credit(s)");
        }
        Commands::Lock {
            db,
            user_id,
            reason,
        } => {
            engine(&db)
                .await?
                .lock_account(&actor, &user_id, &reason, now)
                .await?;
            log::info!("locked {user_id}");
        }
        Commands::Unlock { db, user_id } => {
            engine(&db)
                .await?
                .unlock_account(&actor, &user_id, now)
                .await?;
            log::info!("unlocked {user_id}");
        }
        Commands::SetRole { db, user_id, role } => {
            engine(&db)
                .await?
                .set_role(&actor, &user_id, role, now)
                .await?;
            log::info!("{user_id} is now {}", role.as_str());
        }
        Commands::Grant { db, user_id, days } => {
            let days = days.unwrap_or_else(|| ApiConfig::from_env().subscription_days);
            let sub = engine(&db)
                .await?
                .grant_subscription(&actor, &user_id, days, now)
                .await?;
            log::info!(
                "granted subscription {} to {user_id} until {}",
                sub.id,
                sub.expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            );
        }
        Commands::Cancel {
            db,
            subscription_id,
        } => {
            let sub = engine(&db)
                .await?
                .cancel_subscription(&actor, subscription_id, now)
                .await?;
            log::info!("subscription {} is {}", sub.id, sub.status.as_str());
        }
    }
    Ok(())
}
