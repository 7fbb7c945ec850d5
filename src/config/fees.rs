//! Platform fee configuration
//!
//! Fee percents are expressed in basis points (100 bps = 1%). Amounts are
//! stablecoin minor units. All values are configurable via environment
//! variables with mainnet-ready defaults.

use chrono::NaiveDateTime;
use std::env;

/// Default settlement fee: 0.5%
pub const DEFAULT_BASE_FEE_BPS: i64 = 50;

/// Default minimum fee in minor units (0.01 with 6 decimals = 10_000)
pub const DEFAULT_MIN_FEE: i64 = 10_000;

/// Fee percent above this is almost certainly an operator typo.
pub const MAX_FEE_BPS: i64 = 1_000;

/// A volume-discount tier: trailing monthly volume at or above `min_volume`
/// unlocks `bps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTier {
    pub min_volume: i64,
    pub bps: i64,
}

/// A promotional fee percent, optionally time-boxed.
#[derive(Debug, Clone)]
pub struct PromoFee {
    pub bps: i64,
    pub expires_at: Option<NaiveDateTime>,
}

/// Snapshot of the fee schedule injected into the fee engine.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    pub base_bps: i64,
    pub min_fee: i64,
    pub promo: Option<PromoFee>,
    /// Kept sorted descending by threshold; the engine scans top-down.
    pub tiers: Vec<VolumeTier>,
}

impl FeeConfig {
    pub fn new(
        base_bps: i64,
        min_fee: i64,
        promo: Option<PromoFee>,
        mut tiers: Vec<VolumeTier>,
    ) -> Self {
        tiers.sort_by(|a, b| b.min_volume.cmp(&a.min_volume));
        Self {
            base_bps,
            min_fee,
            promo,
            tiers,
        }
    }

    /// Load the fee schedule from the environment.
    ///
    /// - FEE_BASE_BPS: base percent in bps (default 50 = 0.5%)
    /// - FEE_MIN_AMOUNT: minimum fee in minor units (default 10_000)
    /// - FEE_PROMO_BPS / FEE_PROMO_EXPIRES_AT: optional promo override,
    ///   expiry as "%Y-%m-%dT%H:%M:%S" UTC
    /// - FEE_VOLUME_TIERS: "min_volume:bps" pairs, comma separated,
    ///   e.g. "1000:40,10000:30,50000:10"
    pub fn from_env() -> Self {
        let base_bps = env::var("FEE_BASE_BPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(|bps: i64| {
                if !(0..=MAX_FEE_BPS).contains(&bps) {
                    tracing::warn!(
                        bps,
                        max = MAX_FEE_BPS,
                        "FEE_BASE_BPS out of bounds, using default"
                    );
                    DEFAULT_BASE_FEE_BPS
                } else {
                    bps
                }
            })
            .unwrap_or(DEFAULT_BASE_FEE_BPS);

        let min_fee = env::var("FEE_MIN_AMOUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MIN_FEE);

        let promo = env::var("FEE_PROMO_BPS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(|bps| PromoFee {
                bps,
                expires_at: env::var("FEE_PROMO_EXPIRES_AT")
                    .ok()
                    .and_then(|v| NaiveDateTime::parse_from_str(&v, "%Y-%m-%dT%H:%M:%S").ok()),
            });

        let tiers = env::var("FEE_VOLUME_TIERS")
            .ok()
            .map(|v| parse_tier_table(&v))
            .unwrap_or_default();

        Self::new(base_bps, min_fee, promo, tiers)
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_FEE_BPS, DEFAULT_MIN_FEE, None, Vec::new())
    }
}

/// Parse "min_volume:bps" pairs. Malformed entries are skipped with a warning
/// rather than failing startup.
fn parse_tier_table(raw: &str) -> Vec<VolumeTier> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (volume, bps) = entry.split_once(':')?;
            match (volume.trim().parse(), bps.trim().parse()) {
                (Ok(min_volume), Ok(bps)) => Some(VolumeTier { min_volume, bps }),
                _ => {
                    tracing::warn!(entry, "Skipping malformed FEE_VOLUME_TIERS entry");
                    None
                }
            }
        })
        .collect()
}
