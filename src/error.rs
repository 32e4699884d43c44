use chrono::{DateTime, Utc};
use thiserror::Error;

/// Typed failures of the position lifecycle. Everything except
/// `NoLookaheadViolation` is recoverable at the tick level.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("position capacity of {max_positions} reached")]
    CapacityExceeded { max_positions: usize },

    #[error("a position in {symbol} is already open")]
    AlreadyOpen { symbol: String },

    #[error("no open position in {symbol}")]
    NotOpen { symbol: String },

    #[error("insufficient capital: required {required:.2}, available {available:.2}")]
    InsufficientCapital { required: f64, available: f64 },

    #[error("degenerate stop for {symbol}: entry {entry_price}, stop {stop_loss}")]
    DegenerateStop {
        symbol: String,
        entry_price: f64,
        stop_loss: f64,
    },

    #[error("lookahead detected for {symbol}: bar at {bar_time} is after cutoff {as_of}")]
    NoLookaheadViolation {
        symbol: String,
        as_of: DateTime<Utc>,
        bar_time: DateTime<Utc>,
    },

    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl EngineError {
    /// Only a lookahead violation invalidates the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::NoLookaheadViolation { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::AlreadyOpen { .. } => "already_open",
            EngineError::NotOpen { .. } => "not_open",
            EngineError::InsufficientCapital { .. } => "insufficient_capital",
            EngineError::DegenerateStop { .. } => "degenerate_stop",
            EngineError::NoLookaheadViolation { .. } => "no_lookahead_violation",
            EngineError::InvalidPosition(_) => "invalid_position",
            EngineError::InvalidSnapshot(_) => "invalid_snapshot",
        }
    }
}

/// True when `err` wraps a fatal `EngineError`.
pub fn is_fatal_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<EngineError>()
        .map_or(false, EngineError::is_fatal)
}
