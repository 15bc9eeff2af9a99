// =============================================================================
// Exit Steward: automated exit lifecycle for open positions
// =============================================================================

pub mod api;
pub mod app_state;
pub mod error;
pub mod exit;
pub mod providers;
pub mod runtime_config;
pub mod types;
