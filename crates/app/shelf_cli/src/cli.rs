use clap::{Args, Parser, Subcommand};
use shelf_core::models::Role;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "shelf", version, about = "Shelf entitlement operator tool")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the version
    Version,

    /// Apply pending database migrations
    Migrate {
        #[command(flatten)]
        db: DbArgs,
    },

    /// Expire lapsed subscriptions and refill due credit balances
    Sweep {
        #[command(flatten)]
        db: DbArgs,
    },

    /// Show a user's credit balance as JSON
    Balance {
        #[command(flatten)]
        db: DbArgs,
        user_id: String,
    },

    /// Return credits to a user, capped at the monthly allowance
    Refund {
        #[command(flatten)]
        db: DbArgs,
        user_id: String,
        #[arg(long, default_value_t = 1)]
        amount: i32,
    },

    /// Lock an account so every download is denied
    Lock {
        #[command(flatten)]
        db: DbArgs,
        user_id: String,
        #[arg(long)]
        reason: String,
    },

    /// Unlock an account
    Unlock {
        #[command(flatten)]
        db: DbArgs,
        user_id: String,
    },

    /// Change a user's role (user or admin)
    SetRole {
        #[command(flatten)]
        db: DbArgs,
        user_id: String,
        role: Role,
    },

    /// Grant an active subscription without payment
    Grant {
        #[command(flatten)]
        db: DbArgs,
        user_id: String,
        /// Defaults to SUBSCRIPTION_DAYS
        #[arg(long)]
        days: Option<i64>,
    },

    /// Cancel a subscription by id
    Cancel {
        #[command(flatten)]
        db: DbArgs,
        subscription_id: Uuid,
    },
}
