//! Settlement fee engine
//!
//! Pure computation: given an amount, an optional trailing monthly volume
//! and a fee-schedule snapshot, produce the percent, the fee and the net
//! payout. No clock reads, no I/O; the caller supplies `now` so promo
//! expiry stays deterministic under test.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::config::FeeConfig;

#[derive(Debug, Error)]
pub enum FeeError {
    #[error("trade amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("trailing monthly volume must be non-negative, got {0}")]
    NegativeVolume(i64),
}

/// Result of a fee computation.
///
/// `net_amount` may be zero or negative when the amount is below the
/// configured minimum fee; that is reported as-is. Treating it as a
/// configuration error is the caller's job, not this engine's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub fee_bps: i64,
    pub fee_amount: i64,
    pub net_amount: i64,
}

/// Compute the settlement fee for a trade amount in minor units.
///
/// Percent selection order:
/// 1. base percent from the schedule
/// 2. overridden by an unexpired promo percent, if configured
/// 3. overridden by the highest-threshold volume tier whose minimum is at
///    or below the supplied trailing volume (strictly descending scan)
pub fn compute_fee(
    amount: i64,
    trailing_monthly_volume: Option<i64>,
    config: &FeeConfig,
    now: NaiveDateTime,
) -> Result<FeeBreakdown, FeeError> {
    if amount <= 0 {
        return Err(FeeError::NonPositiveAmount(amount));
    }
    if let Some(volume) = trailing_monthly_volume {
        if volume < 0 {
            return Err(FeeError::NegativeVolume(volume));
        }
    }

    let mut fee_bps = config.base_bps;

    if let Some(promo) = &config.promo {
        let expired = promo.expires_at.map(|at| at <= now).unwrap_or(false);
        if !expired {
            fee_bps = promo.bps;
        }
    }

    if let Some(volume) = trailing_monthly_volume {
        // tiers are kept sorted descending by threshold; first match wins
        if let Some(tier) = config.tiers.iter().find(|t| t.min_volume <= volume) {
            fee_bps = tier.bps;
        }
    }

    let fee_amount = round_half_up_bps(amount, fee_bps).max(config.min_fee);

    Ok(FeeBreakdown {
        fee_bps,
        fee_amount,
        net_amount: amount - fee_amount,
    })
}

/// amount * bps / 10_000, rounded half-up, over i128 intermediates so large
/// principals cannot overflow.
fn round_half_up_bps(amount: i64, bps: i64) -> i64 {
    let product = amount as i128 * bps as i128;
    ((product + 5_000) / 10_000) as i64
}
