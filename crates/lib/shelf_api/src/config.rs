//! API server configuration.

use std::str::FromStr;

use chrono::Duration;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use shelf_core::config::{
    CancellationPolicy, DEFAULT_SUBSCRIPTION_DAYS, EntitlementConfig, FREE_MONTHLY_CREDITS,
    MAX_DOWNLOADS, RateLimitPolicy, WINDOW_HOURS,
};
use tracing::warn;

/// Seconds between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Outbound gateway request timeout.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// HS256 secret shared with the identity provider.
    pub jwt_secret: String,
    /// HMAC secret shared with the payment gateway.
    pub webhook_secret: String,
    /// Payment gateway API base URL.
    pub gateway_url: String,
    /// Bearer secret for outbound gateway calls.
    pub gateway_secret: String,
    pub gateway_timeout_secs: u64,
    /// Subscription price in minor currency units.
    pub subscription_price: i64,
    pub subscription_currency: String,
    pub subscription_days: i64,
    pub sweep_interval_secs: u64,
    pub free_monthly_credits: i32,
    pub max_downloads: i32,
    pub window_hours: i64,
    pub cancellation_policy: CancellationPolicy,
    pub rate_limit_policy: RateLimitPolicy,
    pub rate_limit_unlimited: bool,
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                 | Default                              |
    /// |--------------------------|--------------------------------------|
    /// | `BIND_ADDR`              | `127.0.0.1:3100`                     |
    /// | `DATABASE_URL`           | `postgres://localhost:5432/shelf`    |
    /// | `JWT_SECRET`             | random per process (rejects all)     |
    /// | `WEBHOOK_SECRET`         | empty (rejects all webhooks)         |
    /// | `PAYMENT_GATEWAY_URL`    | `https://api.paystack.co`            |
    /// | `PAYMENT_GATEWAY_SECRET` | empty                                |
    /// | `PAYMENT_GATEWAY_TIMEOUT_SECS` | `10`                           |
    /// | `SUBSCRIPTION_PRICE`     | `500000`                             |
    /// | `SUBSCRIPTION_CURRENCY`  | `NGN`                                |
    /// | `SUBSCRIPTION_DAYS`      | `30`                                 |
    /// | `SWEEP_INTERVAL_SECS`    | `300`                                |
    /// | `FREE_MONTHLY_CREDITS`   | `5`                                  |
    /// | `MAX_DOWNLOADS`          | `10`                                 |
    /// | `WINDOW_HOURS`           | `1`                                  |
    /// | `CANCELLATION_POLICY`    | `at-period-end` (or `immediate`)     |
    /// | `RATE_LIMIT_POLICY`      | `enforced` (`advisory`, `disabled`)  |
    /// | `RATE_LIMIT_UNLIMITED`   | `false`                              |
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_string("BIND_ADDR", "127.0.0.1:3100"),
            database_url: env_string("DATABASE_URL", "postgres://localhost:5432/shelf"),
            jwt_secret: resolve_jwt_secret(),
            webhook_secret: env_string("WEBHOOK_SECRET", ""),
            gateway_url: env_string("PAYMENT_GATEWAY_URL", "https://api.paystack.co"),
            gateway_secret: env_string("PAYMENT_GATEWAY_SECRET", ""),
            gateway_timeout_secs: env_parse(
                "PAYMENT_GATEWAY_TIMEOUT_SECS",
                DEFAULT_GATEWAY_TIMEOUT_SECS,
            ),
            subscription_price: env_parse("SUBSCRIPTION_PRICE", 500_000),
            subscription_currency: env_string("SUBSCRIPTION_CURRENCY", "NGN"),
            subscription_days: env_parse("SUBSCRIPTION_DAYS", DEFAULT_SUBSCRIPTION_DAYS),
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            free_monthly_credits: env_parse("FREE_MONTHLY_CREDITS", FREE_MONTHLY_CREDITS),
            max_downloads: env_parse("MAX_DOWNLOADS", MAX_DOWNLOADS),
            window_hours: env_parse("WINDOW_HOURS", WINDOW_HOURS),
            cancellation_policy: env_parse("CANCELLATION_POLICY", CancellationPolicy::default()),
            rate_limit_policy: env_parse("RATE_LIMIT_POLICY", RateLimitPolicy::default()),
            rate_limit_unlimited: env_parse("RATE_LIMIT_UNLIMITED", false),
        }
    }

    /// Engine tunables derived from this configuration.
    pub fn entitlement_config(&self) -> EntitlementConfig {
        EntitlementConfig {
            free_monthly_credits: self.free_monthly_credits,
            max_downloads: self.max_downloads,
            window: Duration::try_hours(self.window_hours.max(1))
                .unwrap_or_else(|| Duration::hours(WINDOW_HOURS)),
            rate_limit_policy: self.rate_limit_policy,
            rate_limit_unlimited: self.rate_limit_unlimited,
            cancellation_policy: self.cancellation_policy,
            default_subscription_days: self.subscription_days,
            ..EntitlementConfig::default()
        }
        .with_webhook_secret(self.webhook_secret.as_bytes())
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3100".into(),
            database_url: "postgres://localhost:5432/shelf".into(),
            jwt_secret: String::new(),
            webhook_secret: String::new(),
            gateway_url: "https://api.paystack.co".into(),
            gateway_secret: String::new(),
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            subscription_price: 500_000,
            subscription_currency: "NGN".into(),
            subscription_days: DEFAULT_SUBSCRIPTION_DAYS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            free_monthly_credits: FREE_MONTHLY_CREDITS,
            max_downloads: MAX_DOWNLOADS,
            window_hours: WINDOW_HOURS,
            cancellation_policy: CancellationPolicy::default(),
            rate_limit_policy: RateLimitPolicy::default(),
            rate_limit_unlimited: false,
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!(var = name, value = %raw, "ignoring invalid value: {e}");
            default
        }),
        Err(_) => default,
    }
}

/// `JWT_SECRET`, or a random secret that no issued token will match.
fn resolve_jwt_secret() -> String {
    if let Ok(secret) = std::env::var("JWT_SECRET")
        && !secret.is_empty()
    {
        return secret;
    }
    warn!("JWT_SECRET not set; bearer tokens will be rejected");
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlement_config_carries_knobs() {
        let config = ApiConfig {
            free_monthly_credits: 3,
            window_hours: 2,
            webhook_secret: "whsec".into(),
            cancellation_policy: CancellationPolicy::Immediate,
            ..ApiConfig::default()
        };
        let engine = config.entitlement_config();
        assert_eq!(engine.free_monthly_credits, 3);
        assert_eq!(engine.window, Duration::hours(2));
        assert_eq!(engine.webhook_secret, b"whsec".to_vec());
        assert_eq!(engine.cancellation_policy, CancellationPolicy::Immediate);
    }

    #[test]
    fn oversized_window_falls_back_to_default() {
        let config = ApiConfig {
            window_hours: i64::MAX,
            ..ApiConfig::default()
        };
        assert_eq!(config.entitlement_config().window, Duration::hours(WINDOW_HOURS));
    }
}
