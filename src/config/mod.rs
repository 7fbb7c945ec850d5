//! Configuration modules for the LocalStable server
//!
//! All values are read from the environment once at startup and carried as
//! owned snapshots injected into services at construction. Components never
//! read ambient globals at decision time.

pub mod fees;
pub mod limits;
pub mod timeouts;
pub mod webhook;

pub use fees::{FeeConfig, PromoFee, VolumeTier, DEFAULT_BASE_FEE_BPS, DEFAULT_MIN_FEE};
pub use limits::TradeLimitsConfig;
pub use timeouts::TimeoutConfig;
pub use webhook::WebhookConfig;
