pub mod audit;
pub mod ban_guard;
pub mod chain_monitor;
pub mod correlator;
pub mod fees;
pub mod reconciler;
pub mod reputation;
pub mod state_machine;
pub mod timeout_monitor;
