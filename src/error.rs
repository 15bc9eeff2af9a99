// =============================================================================
// Error taxonomy for broker mutations
// =============================================================================
//
// Ownership conflicts are not errors: the monitor yields silently. Persisted
// state corruption is handled inside the rule store (skip or quarantine) and
// never surfaces here.
// =============================================================================

use thiserror::Error;

use crate::types::PositionId;

/// Classified failure returned by an `OrderGateway`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Network failure, timeout, or a broker "busy" answer. Safe to retry.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// The broker refused the request. Retrying will not help.
    #[error("rejected by broker: {0}")]
    Rejected(String),
}

/// Errors produced while applying a mutation to a position.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    /// Transient failures persisted through every retry attempt.
    #[error("transient external failure after {attempts} attempts: {message}")]
    TransientExternalFailure { attempts: u32, message: String },

    /// The broker refused the mutation. Rule state stays unchanged.
    #[error("permanent rejection: {0}")]
    PermanentRejection(String),

    /// The authoritative position could not be read.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// The position no longer exists at the broker.
    #[error("position {0} is no longer open")]
    PositionGone(PositionId),

    /// The requested stop is less protective than the live one.
    #[error("stop regression: requested {requested} is worse than current {current}")]
    StopRegression { requested: f64, current: f64 },

    /// The mutation is malformed (e.g. non-positive volume).
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
}

impl ExecError {
    /// Short machine-readable label for logs and the decision journal.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientExternalFailure { .. } => "TransientExternalFailure",
            Self::PermanentRejection(_) => "PermanentRejection",
            Self::DataUnavailable(_) => "DataUnavailable",
            Self::PositionGone(_) => "PositionGone",
            Self::StopRegression { .. } => "StopRegression",
            Self::InvalidMutation(_) => "InvalidMutation",
        }
    }
}
