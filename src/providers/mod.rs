//! External collaborators.
//!
//! The engine only talks to the outside world through these traits: market
//! data, order submission, ownership lookups and best-effort market-condition
//! snapshots. Concrete adapters live in the submodules.

pub mod http_registry;
pub mod local_registry;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::{
    AdvisorySnapshot, Bar, IndicatorKind, OwnershipRecord, Position, PositionId, SymbolSpec,
};

/// Source of open positions, prices and derived indicators.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// All positions currently open at the broker.
    async fn list_open_positions(&self) -> Result<Vec<Position>>;

    /// Latest price for `symbol`.
    async fn current_price(&self, symbol: &str) -> Result<f64>;

    /// The last `count` bars of `timeframe` for `symbol`, oldest first.
    async fn get_bars(&self, symbol: &str, timeframe: &str, count: usize) -> Result<Vec<Bar>>;

    /// A derived indicator value. Flaky by nature; always called through
    /// the circuit breaker.
    async fn derived_indicator(&self, symbol: &str, kind: IndicatorKind) -> Result<f64>;

    /// Broker trading constraints for `symbol`.
    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec>;
}

/// Order submission to the broker.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Authoritative re-read of a position. `Ok(None)` if it is closed.
    async fn fetch_position(&self, position_id: PositionId)
        -> Result<Option<Position>, GatewayError>;

    async fn modify_stop_target(
        &self,
        position_id: PositionId,
        new_stop: f64,
        new_target: f64,
    ) -> Result<(), GatewayError>;

    async fn close_partial(&self, position_id: PositionId, volume: f64)
        -> Result<(), GatewayError>;

    async fn close_full(&self, position_id: PositionId) -> Result<(), GatewayError>;
}

/// Authority deciding which subsystem may manage a position.
#[async_trait]
pub trait OwnershipRegistry: Send + Sync {
    async fn get_owner(&self, position_id: PositionId) -> Result<OwnershipRecord>;
}

/// Best-effort market-condition signals.
#[async_trait]
pub trait MarketConditionProvider: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<AdvisorySnapshot>;
}
