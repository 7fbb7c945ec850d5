//! Trade amount limits
//!
//! Minimum/maximum stablecoin amounts per account verification tier, plus
//! per-currency fiat floors. Supplied externally; nothing here is consulted
//! at decision time without passing through a service constructor.

use std::collections::HashMap;
use std::env;

/// Default limits (minor units, 6 decimals): 10 .. 1,000 units for basic,
/// 10 .. 25,000 units for verified accounts.
const DEFAULT_BASIC_MIN: i64 = 10_000_000;
const DEFAULT_BASIC_MAX: i64 = 1_000_000_000;
const DEFAULT_VERIFIED_MIN: i64 = 10_000_000;
const DEFAULT_VERIFIED_MAX: i64 = 25_000_000_000;

#[derive(Debug, Clone)]
pub struct TradeLimitsConfig {
    /// verification_tier -> (min, max) stablecoin amount in minor units
    tiers: HashMap<String, (i64, i64)>,
    /// fiat currency code -> minimum fiat amount in fiat minor units
    fiat_minimums: HashMap<String, i64>,
}

impl TradeLimitsConfig {
    pub fn new(tiers: HashMap<String, (i64, i64)>, fiat_minimums: HashMap<String, i64>) -> Self {
        Self {
            tiers,
            fiat_minimums,
        }
    }

    /// Load limits from the environment.
    ///
    /// - TRADE_LIMIT_BASIC: "min:max" in minor units
    /// - TRADE_LIMIT_VERIFIED: "min:max" in minor units
    /// - FIAT_MINIMUMS: "CUR:amount" pairs, comma separated ("USD:500,EUR:500")
    pub fn from_env() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "basic".to_string(),
            env_range("TRADE_LIMIT_BASIC", DEFAULT_BASIC_MIN, DEFAULT_BASIC_MAX),
        );
        tiers.insert(
            "verified".to_string(),
            env_range("TRADE_LIMIT_VERIFIED", DEFAULT_VERIFIED_MIN, DEFAULT_VERIFIED_MAX),
        );

        let fiat_minimums = env::var("FIAT_MINIMUMS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|entry| {
                        let (currency, amount) = entry.trim().split_once(':')?;
                        amount
                            .trim()
                            .parse()
                            .ok()
                            .map(|a| (currency.trim().to_uppercase(), a))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self::new(tiers, fiat_minimums)
    }

    /// Amount bounds for an account tier. Unknown tiers get the basic bounds.
    pub fn bounds_for_tier(&self, tier: &str) -> (i64, i64) {
        self.tiers
            .get(tier)
            .copied()
            .unwrap_or((DEFAULT_BASIC_MIN, DEFAULT_BASIC_MAX))
    }

    /// Minimum fiat amount for a currency, if one is configured.
    pub fn fiat_minimum(&self, currency: &str) -> Option<i64> {
        self.fiat_minimums.get(&currency.to_uppercase()).copied()
    }
}

impl Default for TradeLimitsConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert("basic".to_string(), (DEFAULT_BASIC_MIN, DEFAULT_BASIC_MAX));
        tiers.insert(
            "verified".to_string(),
            (DEFAULT_VERIFIED_MIN, DEFAULT_VERIFIED_MAX),
        );
        Self::new(tiers, HashMap::new())
    }
}

fn env_range(key: &str, default_min: i64, default_max: i64) -> (i64, i64) {
    env::var(key)
        .ok()
        .and_then(|v| {
            let (min, max) = v.split_once(':')?;
            Some((min.trim().parse().ok()?, max.trim().parse().ok()?))
        })
        .filter(|(min, max)| min <= max)
        .unwrap_or((default_min, default_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tier_falls_back_to_basic() {
        let config = TradeLimitsConfig::default();
        assert_eq!(config.bounds_for_tier("mystery"), config.bounds_for_tier("basic"));
    }

    #[test]
    fn test_fiat_minimum_lookup_is_case_insensitive() {
        let mut fiat = HashMap::new();
        fiat.insert("USD".to_string(), 500);
        let config = TradeLimitsConfig::new(HashMap::new(), fiat);
        assert_eq!(config.fiat_minimum("usd"), Some(500));
        assert_eq!(config.fiat_minimum("JPY"), None);
    }
}
