// Export sanitization macros for logs (BEFORE modules)
#[macro_export]
macro_rules! log_txid {
    ($txid:expr) => {
        $crate::logging::sanitize::sanitize_txid($txid)
    };
}

#[macro_export]
macro_rules! log_trade_id {
    ($id:expr) => {
        $crate::logging::sanitize::sanitize_trade_id($id)
    };
}

#[macro_export]
macro_rules! log_amount {
    ($amount:expr) => {
        $crate::logging::sanitize::sanitize_amount($amount)
    };
}

pub mod chain;
pub mod config;
pub mod db;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod schema;
pub mod services;
pub mod telemetry;
