// =============================================================================
// Paper Broker: in-memory positions for demo mode
// =============================================================================
//
// Implements the market-data, order-gateway and market-condition interfaces
// over a local book of simulated positions:
//
//   open_position  ->  update_price / modify_stop_target / close_partial
//                  ->  close_full (moved to the closed list)
//
// Indicator values and advisory snapshots are injected by the caller; the
// broker never computes them. A missing indicator is reported as an error,
// which the circuit breaker treats like any other provider failure.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{MarketConditionProvider, MarketDataProvider, OrderGateway};
use crate::error::GatewayError;
use crate::types::{
    AdvisorySnapshot, Bar, Direction, IndicatorKind, Position, PositionId, SymbolSpec,
};

/// Bars retained per symbol.
const MAX_BARS: usize = 500;

/// A position closed by the paper broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub close_price: f64,
    pub realized_pnl: f64,
    pub closed_at: String,
}

/// In-memory broker used in demo mode and by tests.
pub struct PaperBroker {
    next_id: AtomicU64,
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<ClosedPosition>>,
    /// Realised PnL of partial closes, per position.
    partial_pnl: RwLock<HashMap<PositionId, f64>>,
    prices: RwLock<HashMap<String, f64>>,
    bars: RwLock<HashMap<String, Vec<Bar>>>,
    indicators: RwLock<HashMap<(String, IndicatorKind), f64>>,
    specs: RwLock<HashMap<String, SymbolSpec>>,
    snapshots: RwLock<HashMap<String, AdvisorySnapshot>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            partial_pnl: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            bars: RwLock::new(HashMap::new()),
            indicators: RwLock::new(HashMap::new()),
            specs: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Book management
    // -------------------------------------------------------------------------

    /// Open a simulated position and return its ticket.
    pub fn open_position(
        &self,
        symbol: &str,
        direction: Direction,
        entry_price: f64,
        volume: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> PositionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pos = Position {
            position_id: id,
            symbol: symbol.to_string(),
            direction,
            entry_price,
            volume,
            stop_loss,
            take_profit,
            current_price: entry_price,
        };

        info!(
            position_id = id,
            symbol,
            direction = %direction,
            entry_price,
            volume,
            stop_loss,
            take_profit,
            "paper position opened"
        );

        self.open.write().push(pos);
        self.prices
            .write()
            .entry(symbol.to_string())
            .or_insert(entry_price);
        id
    }

    /// Push a new price for `symbol`. Each push is recorded as a flat bar.
    pub fn update_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);

        for pos in self.open.write().iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = price;
        }

        let mut bars = self.bars.write();
        let series = bars.entry(symbol.to_string()).or_default();
        series.push(Bar {
            open_time: Utc::now(),
            open: price,
            high: price,
            low: price,
            close: price,
        });
        if series.len() > MAX_BARS {
            let excess = series.len() - MAX_BARS;
            series.drain(..excess);
        }
    }

    pub fn set_indicator(&self, symbol: &str, kind: IndicatorKind, value: f64) {
        self.indicators
            .write()
            .insert((symbol.to_string(), kind), value);
    }

    pub fn clear_indicator(&self, symbol: &str, kind: IndicatorKind) {
        self.indicators.write().remove(&(symbol.to_string(), kind));
    }

    pub fn set_symbol_spec(&self, symbol: &str, spec: SymbolSpec) {
        self.specs.write().insert(symbol.to_string(), spec);
    }

    pub fn set_snapshot(&self, symbol: &str, snapshot: AdvisorySnapshot) {
        self.snapshots.write().insert(symbol.to_string(), snapshot);
    }

    /// Return the most recent `count` closed positions (newest first).
    pub fn closed_positions(&self, count: usize) -> Vec<ClosedPosition> {
        self.closed.read().iter().rev().take(count).cloned().collect()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    fn price_of(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).copied()
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// MarketDataProvider
// =============================================================================

#[async_trait]
impl MarketDataProvider for PaperBroker {
    async fn list_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.open_positions())
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        self.price_of(symbol)
            .ok_or_else(|| anyhow!("no price for {symbol}"))
    }

    async fn get_bars(&self, symbol: &str, _timeframe: &str, count: usize) -> Result<Vec<Bar>> {
        let bars = self.bars.read();
        let series = bars.get(symbol).map(Vec::as_slice).unwrap_or_default();
        let start = series.len().saturating_sub(count);
        Ok(series[start..].to_vec())
    }

    async fn derived_indicator(&self, symbol: &str, kind: IndicatorKind) -> Result<f64> {
        self.indicators
            .read()
            .get(&(symbol.to_string(), kind))
            .copied()
            .ok_or_else(|| anyhow!("{kind} not available for {symbol}"))
    }

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec> {
        Ok(self.specs.read().get(symbol).copied().unwrap_or_default())
    }
}

// =============================================================================
// OrderGateway
// =============================================================================

#[async_trait]
impl OrderGateway for PaperBroker {
    async fn fetch_position(
        &self,
        position_id: PositionId,
    ) -> Result<Option<Position>, GatewayError> {
        Ok(self
            .open
            .read()
            .iter()
            .find(|p| p.position_id == position_id)
            .cloned())
    }

    async fn modify_stop_target(
        &self,
        position_id: PositionId,
        new_stop: f64,
        new_target: f64,
    ) -> Result<(), GatewayError> {
        let mut open = self.open.write();
        let pos = open
            .iter_mut()
            .find(|p| p.position_id == position_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown position {position_id}")))?;

        // A stop on the wrong side of the market would fill immediately.
        let price = pos.current_price;
        let stop_valid = new_stop <= 0.0
            || match pos.direction {
                Direction::Long => new_stop < price,
                Direction::Short => new_stop > price,
            };
        if !stop_valid {
            return Err(GatewayError::Rejected(format!(
                "invalid stop {new_stop} for {} at price {price}",
                pos.direction
            )));
        }

        debug!(
            position_id,
            old_stop = pos.stop_loss,
            new_stop,
            new_target,
            "paper stop/target modified"
        );
        pos.stop_loss = new_stop;
        pos.take_profit = new_target;
        Ok(())
    }

    async fn close_partial(
        &self,
        position_id: PositionId,
        volume: f64,
    ) -> Result<(), GatewayError> {
        let mut open = self.open.write();
        let pos = open
            .iter_mut()
            .find(|p| p.position_id == position_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown position {position_id}")))?;

        if volume <= 0.0 || volume >= pos.volume {
            return Err(GatewayError::Rejected(format!(
                "partial volume {volume} invalid for remaining {}",
                pos.volume
            )));
        }

        let pnl = pos.direction.sign() * (pos.current_price - pos.entry_price) * volume;
        pos.volume -= volume;
        *self.partial_pnl.write().entry(position_id).or_insert(0.0) += pnl;

        info!(
            position_id,
            close_volume = volume,
            remaining = pos.volume,
            partial_pnl = pnl,
            "paper partial close executed"
        );
        Ok(())
    }

    async fn close_full(&self, position_id: PositionId) -> Result<(), GatewayError> {
        let mut open = self.open.write();
        let idx = open
            .iter()
            .position(|p| p.position_id == position_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown position {position_id}")))?;
        let pos = open.remove(idx);
        drop(open);

        let close_price = pos.current_price;
        let final_pnl = pos.direction.sign() * (close_price - pos.entry_price) * pos.volume;
        let partial = self
            .partial_pnl
            .write()
            .remove(&position_id)
            .unwrap_or(0.0);
        let realized_pnl = partial + final_pnl;

        info!(position_id, close_price, realized_pnl, "paper position closed");

        self.closed.write().push(ClosedPosition {
            position: pos,
            close_price,
            realized_pnl,
            closed_at: Utc::now().to_rfc3339(),
        });
        Ok(())
    }
}

// =============================================================================
// MarketConditionProvider
// =============================================================================

#[async_trait]
impl MarketConditionProvider for PaperBroker {
    async fn snapshot(&self, symbol: &str) -> Result<AdvisorySnapshot> {
        let mut snap = self
            .snapshots
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        snap.fetched_at = Some(Utc::now());
        Ok(snap)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_modify_partial_close() {
        let broker = PaperBroker::new();
        let id = broker.open_position("XAUUSD", Direction::Long, 100.0, 1.0, 99.0, 102.0);
        broker.update_price("XAUUSD", 101.0);

        broker.modify_stop_target(id, 100.1, 102.0).await.unwrap();
        let pos = broker.fetch_position(id).await.unwrap().unwrap();
        assert!((pos.stop_loss - 100.1).abs() < 1e-9);

        broker.close_partial(id, 0.4).await.unwrap();
        let pos = broker.fetch_position(id).await.unwrap().unwrap();
        assert!((pos.volume - 0.6).abs() < 1e-9);

        broker.close_full(id).await.unwrap();
        assert!(broker.fetch_position(id).await.unwrap().is_none());

        let closed = broker.closed_positions(10);
        assert_eq!(closed.len(), 1);
        // 0.4 @ +1.0 plus 0.6 @ +1.0
        assert!((closed[0].realized_pnl - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_through_market_is_rejected() {
        let broker = PaperBroker::new();
        let id = broker.open_position("XAUUSD", Direction::Short, 100.0, 1.0, 101.0, 98.0);
        broker.update_price("XAUUSD", 99.5);

        let err = broker.modify_stop_target(id, 99.0, 98.0).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_indicator_is_an_error() {
        let broker = PaperBroker::new();
        assert!(broker
            .derived_indicator("XAUUSD", IndicatorKind::Atr)
            .await
            .is_err());

        broker.set_indicator("XAUUSD", IndicatorKind::Atr, 0.4);
        let atr = broker
            .derived_indicator("XAUUSD", IndicatorKind::Atr)
            .await
            .unwrap();
        assert!((atr - 0.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn bars_follow_price_pushes() {
        let broker = PaperBroker::new();
        for p in [1.0, 2.0, 3.0] {
            broker.update_price("EURUSD", p);
        }
        let bars = broker.get_bars("EURUSD", "M1", 2).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert!((bars[1].close - 3.0).abs() < f64::EPSILON);
    }
}
