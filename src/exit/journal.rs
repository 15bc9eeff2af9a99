// =============================================================================
// Decision Journal: auditable record of every exit decision
// =============================================================================
//
// The monitor reports to a single injected `DecisionSink` at well-defined
// points: gate result, mutation result, ownership yield/skip, rule creation
// and removal. The default `DecisionJournal` emits a structured tracing
// event for each record and keeps the most recent ones for the control API.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::PositionId;

/// Records retained by the in-memory journal.
pub const JOURNAL_CAPACITY: usize = 200;

/// Decision point that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecisionKind {
    RuleCreated,
    RuleRemoved,
    Gate,
    Mutation,
    OwnershipYield,
    OwnershipSkip,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RuleCreated => "RULE_CREATED",
            Self::RuleRemoved => "RULE_REMOVED",
            Self::Gate => "GATE",
            Self::Mutation => "MUTATION",
            Self::OwnershipYield => "OWNERSHIP_YIELD",
            Self::OwnershipSkip => "OWNERSHIP_SKIP",
        };
        f.write_str(s)
    }
}

/// One auditable decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub position_id: PositionId,
    pub symbol: String,
    pub kind: DecisionKind,
    /// Short verdict, e.g. "ADMIT", "APPLIED", "StopRegression".
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_stop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_stop: Option<f64>,
    /// ISO 8601 timestamp.
    pub created_at: String,
    /// Free-form structured context (gate reasons, volumes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DecisionRecord {
    pub fn new(
        position_id: PositionId,
        symbol: impl Into<String>,
        kind: DecisionKind,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            position_id,
            symbol: symbol.into(),
            kind,
            outcome: outcome.into(),
            reason: None,
            old_stop: None,
            new_stop: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            details: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_stops(mut self, old_stop: Option<f64>, new_stop: Option<f64>) -> Self {
        self.old_stop = old_stop;
        self.new_stop = new_stop;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn is_failure(&self) -> bool {
        self.kind == DecisionKind::Mutation
            && !matches!(self.outcome.as_str(), "APPLIED" | "NOOP" | "SKIPPED")
    }
}

/// Receiver of decision records.
pub trait DecisionSink: Send + Sync {
    fn record(&self, record: DecisionRecord);
}

/// Tracing-backed sink with a bounded in-memory ring.
#[derive(Debug)]
pub struct DecisionJournal {
    capacity: usize,
    records: Mutex<VecDeque<DecisionRecord>>,
}

impl DecisionJournal {
    pub fn new() -> Self {
        Self::with_capacity(JOURNAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<DecisionRecord> {
        self.records.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Records for one position, newest first.
    pub fn for_position(&self, position_id: PositionId) -> Vec<DecisionRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.position_id == position_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for DecisionJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionSink for DecisionJournal {
    fn record(&self, record: DecisionRecord) {
        if record.is_failure() {
            warn!(
                position_id = record.position_id,
                symbol = %record.symbol,
                kind = %record.kind,
                outcome = %record.outcome,
                reason = record.reason.as_deref().unwrap_or(""),
                old_stop = record.old_stop,
                new_stop = record.new_stop,
                "exit decision"
            );
        } else {
            info!(
                position_id = record.position_id,
                symbol = %record.symbol,
                kind = %record.kind,
                outcome = %record.outcome,
                reason = record.reason.as_deref().unwrap_or(""),
                old_stop = record.old_stop,
                new_stop = record.new_stop,
                "exit decision"
            );
        }

        let mut ring = self.records.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_newest() {
        let journal = DecisionJournal::with_capacity(3);
        for id in 1..=5 {
            journal.record(DecisionRecord::new(id, "X", DecisionKind::Gate, "ADMIT"));
        }
        let recent = journal.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].position_id, 5);
        assert_eq!(recent[2].position_id, 3);
    }

    #[test]
    fn filter_by_position() {
        let journal = DecisionJournal::new();
        journal.record(DecisionRecord::new(1, "X", DecisionKind::RuleCreated, "CREATED"));
        journal.record(
            DecisionRecord::new(2, "Y", DecisionKind::Mutation, "StopRegression")
                .with_reason("requested 99 below 100")
                .with_stops(Some(100.0), Some(99.0)),
        );
        let only = journal.for_position(2);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].old_stop, Some(100.0));
        assert!(only[0].is_failure());
    }

    #[test]
    fn serialises_without_empty_fields() {
        let rec = DecisionRecord::new(1, "X", DecisionKind::OwnershipYield, "YIELD");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["kind"], "OwnershipYield");
        assert!(json.get("reason").is_none());
    }
}
