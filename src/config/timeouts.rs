//! Trade timeout configuration
//!
//! Deadlines are stamped onto each trade at creation and evaluated lazily on
//! access; the background sweep only accelerates what lazy evaluation would
//! do anyway.

use std::env;

/// Default window for the buyer's deposit to land: 1 hour
pub const DEFAULT_FUNDING_TIMEOUT_SECS: i64 = 3_600;

/// Default window for fiat settlement after funding: 24 hours
pub const DEFAULT_TRADE_TIMEOUT_SECS: i64 = 86_400;

/// Default interval for the deadline sweep worker
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub funding_timeout_secs: i64,
    pub trade_timeout_secs: i64,
    pub sweep_interval_secs: u64,
}

impl TimeoutConfig {
    /// Load timeout windows from the environment.
    ///
    /// - TRADE_FUNDING_TIMEOUT_SECS (default 3600)
    /// - TRADE_SETTLEMENT_TIMEOUT_SECS (default 86400)
    /// - TRADE_SWEEP_INTERVAL_SECS (default 300)
    pub fn from_env() -> Self {
        Self {
            funding_timeout_secs: env_i64("TRADE_FUNDING_TIMEOUT_SECS", DEFAULT_FUNDING_TIMEOUT_SECS),
            trade_timeout_secs: env_i64("TRADE_SETTLEMENT_TIMEOUT_SECS", DEFAULT_TRADE_TIMEOUT_SECS),
            sweep_interval_secs: env::var("TRADE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            funding_timeout_secs: DEFAULT_FUNDING_TIMEOUT_SECS,
            trade_timeout_secs: DEFAULT_TRADE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &i64| *v > 0)
        .unwrap_or(default)
}
