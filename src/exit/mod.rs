// =============================================================================
// Exit Management Module
// =============================================================================
//
// Per-position exit rules (break-even, partial profit, trailing, reversal)
// driven by a periodic monitor, with a circuit breaker around derived
// indicators, ownership arbitration against sibling managers, and retrying
// idempotent broker mutations.

pub mod circuit_breaker;
pub mod executor;
pub mod gate;
pub mod journal;
pub mod monitor;
pub mod ownership;
pub mod rule;
pub mod store;
