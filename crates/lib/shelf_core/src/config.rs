//! Entitlement engine configuration.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Metered downloads granted per reset window.
pub const FREE_MONTHLY_CREDITS: i32 = 5;

/// Downloads allowed inside one rate-limit window.
pub const MAX_DOWNLOADS: i32 = 10;

/// Rate-limit window length.
pub const WINDOW_HOURS: i64 = 1;

/// Length of a paid period when the gateway does not say otherwise.
pub const DEFAULT_SUBSCRIPTION_DAYS: i64 = 30;

/// Rolling credit reset period.
pub const DEFAULT_RESET_DAYS: i64 = 30;

/// Longest rolling reset period; larger settings are clamped to it.
pub const MAX_RESET_DAYS: i64 = 3650;

/// Upper bound on records a single sweep pass touches.
pub const SWEEP_BATCH_SIZE: i64 = 500;

/// When a cancelled subscription stops granting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancellationPolicy {
    /// Access continues until the paid period's `expires_at`.
    #[default]
    AtPeriodEnd,
    /// Access ends the moment the subscription is cancelled.
    Immediate,
}

/// How the short-window rate limit interacts with the credit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitPolicy {
    /// Exceeding the window denies the download.
    #[default]
    Enforced,
    /// Exceeding the window is logged but the download proceeds.
    Advisory,
    /// No window accounting at all.
    Disabled,
}

impl FromStr for CancellationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "at-period-end" => Ok(CancellationPolicy::AtPeriodEnd),
            "immediate" => Ok(CancellationPolicy::Immediate),
            other => Err(format!("unknown cancellation policy '{other}'")),
        }
    }
}

impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enforced" => Ok(RateLimitPolicy::Enforced),
            "advisory" => Ok(RateLimitPolicy::Advisory),
            "disabled" => Ok(RateLimitPolicy::Disabled),
            other => Err(format!("unknown rate limit policy '{other}'")),
        }
    }
}

/// When metered credits refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetSchedule {
    /// Every `days` days from the previous reset.
    Rolling { days: i64 },
    /// 00:00 UTC on the first day of each month.
    CalendarMonth,
}

impl Default for ResetSchedule {
    fn default() -> Self {
        ResetSchedule::Rolling {
            days: DEFAULT_RESET_DAYS,
        }
    }
}

impl ResetSchedule {
    /// The first reset boundary strictly after `now`, stepping from `from`.
    ///
    /// `from` is the previous boundary (or `now` for a new balance); whole
    /// windows are skipped so a long-idle balance lands in the current window.
    pub fn next_after(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            ResetSchedule::Rolling { days } => {
                let step = Duration::days(days.clamp(1, MAX_RESET_DAYS));
                if from > now {
                    return from;
                }
                let windows = (now - from).num_seconds() / step.num_seconds() + 1;
                i32::try_from(windows)
                    .ok()
                    .and_then(|n| step.checked_mul(n))
                    .and_then(|offset| from.checked_add_signed(offset))
                    .or_else(|| now.checked_add_signed(step))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            ResetSchedule::CalendarMonth => {
                let first = Utc
                    .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                first.checked_add_months(Months::new(1)).unwrap_or(first)
            }
        }
    }
}

/// Bounded retry for conditioned writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay; each retry sleeps a random duration up to `base * attempt`.
    pub base_delay: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: StdDuration::from_millis(2),
        }
    }
}

/// Tunables for the entitlement engine.
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    pub free_monthly_credits: i32,
    pub reset_schedule: ResetSchedule,
    pub max_downloads: i32,
    pub window: Duration,
    pub rate_limit_policy: RateLimitPolicy,
    /// Apply the download window to unlimited users too.
    pub rate_limit_unlimited: bool,
    pub cancellation_policy: CancellationPolicy,
    pub default_subscription_days: i64,
    /// Shared secret for webhook HMAC verification.
    pub webhook_secret: Vec<u8>,
    pub retry: RetryPolicy,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            free_monthly_credits: FREE_MONTHLY_CREDITS,
            reset_schedule: ResetSchedule::default(),
            max_downloads: MAX_DOWNLOADS,
            window: Duration::hours(WINDOW_HOURS),
            rate_limit_policy: RateLimitPolicy::default(),
            rate_limit_unlimited: false,
            cancellation_policy: CancellationPolicy::default(),
            default_subscription_days: DEFAULT_SUBSCRIPTION_DAYS,
            webhook_secret: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EntitlementConfig {
    pub fn with_webhook_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.webhook_secret = secret.into();
        self
    }
}
