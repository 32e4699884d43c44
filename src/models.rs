use crate::error::EngineError;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One OHLCV bar for a symbol. `date` is the bar's close timestamp; a bar
/// stamped `t` is visible to every tick at or after `t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    EndOfRun,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::EndOfRun => "END_OF_RUN",
            ExitReason::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STOP_LOSS" | "SL" => Ok(ExitReason::StopLoss),
            "TAKE_PROFIT" | "TP" => Ok(ExitReason::TakeProfit),
            "END_OF_RUN" | "END" => Ok(ExitReason::EndOfRun),
            "MANUAL" => Ok(ExitReason::Manual),
            other => Err(anyhow!("Unknown exit reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    NoTrade,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::NoTrade => "NO_TRADE",
        }
    }
}

/// Output of an external signal provider for one symbol at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDecision {
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub expected_return: f64,
    pub win_probability: f64,
    pub expected_value: f64,
    pub volatility_proxy: f64,
}

impl SignalDecision {
    pub fn no_trade(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: SignalAction::NoTrade,
            confidence: 0.0,
            expected_return: 0.0,
            win_probability: 0.0,
            expected_value: 0.0,
            volatility_proxy: 0.0,
        }
    }

    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            expected_return: self.expected_return,
            confidence: self.confidence,
            expected_value: self.expected_value,
        }
    }
}

/// Inputs that justified an entry, kept on the position for audit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSnapshot {
    pub expected_return: f64,
    pub confidence: f64,
    pub expected_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub shares: u32,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub signal: SignalSnapshot,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    pub fn cost(&self) -> f64 {
        self.shares as f64 * self.entry_price
    }

    pub fn is_closed(&self) -> bool {
        self.exit_reason.is_some()
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.shares as f64 * price
    }

    pub fn pnl(&self) -> Option<f64> {
        self.exit_price
            .map(|exit| (exit - self.entry_price) * self.shares as f64)
    }

    pub fn return_pct(&self) -> Option<f64> {
        self.exit_price.map(|exit| exit / self.entry_price - 1.0)
    }

    pub fn days_held(&self) -> Option<i64> {
        self.exit_time
            .map(|exit| (exit - self.entry_time).num_days())
    }

    /// Sets all exit fields together. A position closes exactly once.
    pub(crate) fn close(
        &mut self,
        exit_price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::NotOpen {
                symbol: self.symbol.clone(),
            });
        }
        if !exit_price.is_finite() || exit_price < 0.0 {
            return Err(EngineError::InvalidPosition(format!(
                "exit price {} for {} is not a valid price",
                exit_price, self.symbol
            )));
        }
        self.exit_time = Some(at);
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(reason);
        Ok(())
    }

    /// Checks the field-level invariants of an open or closed record.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::InvalidPosition("empty symbol".to_string()));
        }
        if !(self.entry_price.is_finite() && self.entry_price > 0.0) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: entry price {} must be positive",
                self.symbol, self.entry_price
            )));
        }
        if self.shares == 0 {
            return Err(EngineError::InvalidPosition(format!(
                "{}: share count must be positive",
                self.symbol
            )));
        }
        if !(self.stop_loss < self.entry_price && self.entry_price < self.take_profit) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: levels must satisfy stop {} < entry {} < take profit {}",
                self.symbol, self.stop_loss, self.entry_price, self.take_profit
            )));
        }
        let exit_fields = [
            self.exit_time.is_some(),
            self.exit_price.is_some(),
            self.exit_reason.is_some(),
        ];
        if exit_fields.iter().any(|set| *set) && !exit_fields.iter().all(|set| *set) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: exit fields are partially set",
                self.symbol
            )));
        }
        Ok(())
    }
}

pub fn generate_position_id(symbol: &str, entry_time: DateTime<Utc>) -> String {
    format!("{}_{}", symbol, entry_time.format("%Y-%m-%dT%H:%M"))
}

/// One point of the equity curve, recorded last in every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquitySample {
    pub timestamp: DateTime<Utc>,
    pub capital: f64,
    pub total_equity: f64,
    pub open_position_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub at: DateTime<Utc>,
    pub symbols: Vec<String>,
}

/// Why a symbol produced no state change in a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NoData,
    SignalError(String),
    NoTrade,
    BelowThreshold,
    DegenerateStop,
    ZeroShares,
    Rejected(String),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NoData => "no_data",
            SkipReason::SignalError(_) => "signal_error",
            SkipReason::NoTrade => "no_trade",
            SkipReason::BelowThreshold => "below_threshold",
            SkipReason::DegenerateStop => "degenerate_stop",
            SkipReason::ZeroShares => "zero_shares",
            SkipReason::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipStage {
    Exit,
    Admission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSkip {
    pub symbol: String,
    pub stage: SkipStage,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Opened { shares: u32, entry_price: f64 },
    Skipped { reason: SkipReason },
}

/// Audit entry for one admission attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,
    pub symbol: String,
    pub decision: Option<SignalDecision>,
    pub outcome: AdmissionOutcome,
}
