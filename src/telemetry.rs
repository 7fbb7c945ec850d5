//! Telemetry bootstrap for the LocalStable server
//!
//! Structured logging via tracing-subscriber with env-filter control.
//!
//! Environment Variables:
//! - RUST_LOG: standard env-filter directives (default: info with noisy
//!   framework targets turned down)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging
///
/// Safe to call once at startup; tests install their own subscribers.
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,actix_web=info,actix_server=info,diesel=warn".into());

    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
