use crate::error::EngineError;
use crate::models::{generate_position_id, ExitReason, Position, SignalSnapshot};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};

/// Parameters of a new long position.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub symbol: String,
    pub entry_price: f64,
    pub shares: u32,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub signal: SignalSnapshot,
}

/// Owns cash, the open positions (at most one per symbol) and the ledger of
/// closed positions. Every capital mutation goes through `open` or `close`.
///
/// Not thread-safe by contract: one clock mutates one book.
#[derive(Debug, Clone)]
pub struct PositionBook {
    max_positions: usize,
    capital: f64,
    open_positions: BTreeMap<String, Position>,
    closed_trades: Vec<Position>,
}

impl PositionBook {
    pub fn new(initial_capital: f64, max_positions: usize) -> Self {
        Self {
            max_positions,
            capital: initial_capital.max(0.0),
            open_positions: BTreeMap::new(),
            closed_trades: Vec::new(),
        }
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn open_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.open_positions.len() < self.max_positions
    }

    pub fn is_open(&self, symbol: &str) -> bool {
        self.open_positions.contains_key(symbol)
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.open_positions.get(symbol)
    }

    /// Open positions in symbol order.
    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.open_positions.values()
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.open_positions.keys().cloned().collect()
    }

    pub fn closed_trades(&self) -> &[Position] {
        &self.closed_trades
    }

    /// Cost basis of all open positions.
    pub fn open_cost(&self) -> f64 {
        self.open_positions.values().map(Position::cost).sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.closed_trades.iter().filter_map(Position::pnl).sum()
    }

    /// Checks run in a fixed order and a failed call leaves the book untouched.
    pub fn open(
        &mut self,
        request: OpenRequest,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        if self.open_positions.len() >= self.max_positions {
            return Err(EngineError::CapacityExceeded {
                max_positions: self.max_positions,
            });
        }
        if self.open_positions.contains_key(&request.symbol) {
            return Err(EngineError::AlreadyOpen {
                symbol: request.symbol,
            });
        }

        let position = Position {
            id: generate_position_id(&request.symbol, now),
            symbol: request.symbol,
            entry_time: now,
            entry_price: request.entry_price,
            shares: request.shares,
            take_profit: request.take_profit,
            stop_loss: request.stop_loss,
            signal: request.signal,
            exit_time: None,
            exit_price: None,
            exit_reason: None,
        };
        position.validate()?;

        let cost = position.cost();
        if cost > self.capital {
            return Err(EngineError::InsufficientCapital {
                required: cost,
                available: self.capital,
            });
        }

        self.capital -= cost;
        info!(
            "Opened {} x{} @ {:.4} (TP {:.4}, SL {:.4}); capital {:.2}",
            position.symbol,
            position.shares,
            position.entry_price,
            position.take_profit,
            position.stop_loss,
            self.capital
        );
        self.open_positions
            .insert(position.symbol.clone(), position.clone());
        Ok(position)
    }

    /// Credits the proceeds and moves the position to the closed ledger.
    pub fn close(
        &mut self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        let Some(mut position) = self.open_positions.remove(symbol) else {
            return Err(EngineError::NotOpen {
                symbol: symbol.to_string(),
            });
        };

        if let Err(err) = position.close(exit_price, reason, now) {
            self.open_positions.insert(symbol.to_string(), position);
            return Err(err);
        }

        self.capital += position.market_value(exit_price);
        info!(
            "Closed {} x{} @ {:.4} ({}), pnl {:.2}; capital {:.2}",
            position.symbol,
            position.shares,
            exit_price,
            reason,
            position.pnl().unwrap_or(0.0),
            self.capital
        );
        self.closed_trades.push(position.clone());
        Ok(position)
    }

    /// Capital plus open positions valued at `prices`; a symbol without a
    /// price is valued at its cost basis.
    pub fn mark_to_market(&self, prices: &HashMap<String, f64>) -> f64 {
        let positions_value: f64 = self
            .open_positions
            .values()
            .map(|position| match prices.get(&position.symbol) {
                Some(price) if price.is_finite() && *price >= 0.0 => {
                    position.market_value(*price)
                }
                _ => {
                    debug!(
                        "No price for {}; valuing at cost {:.2}",
                        position.symbol,
                        position.cost()
                    );
                    position.cost()
                }
            })
            .sum();
        self.capital + positions_value
    }

    /// Replaces the whole book with a persisted state. Restoring the same
    /// state twice leaves the book identical to restoring it once.
    pub fn restore(
        &mut self,
        capital: f64,
        open_positions: Vec<Position>,
        closed_trades: Vec<Position>,
    ) -> Result<(), EngineError> {
        if !capital.is_finite() || capital < 0.0 {
            return Err(EngineError::InvalidSnapshot(format!(
                "capital {} must be a non-negative number",
                capital
            )));
        }

        let mut open_map = BTreeMap::new();
        for position in open_positions {
            position
                .validate()
                .map_err(|err| EngineError::InvalidSnapshot(err.to_string()))?;
            if position.is_closed() {
                return Err(EngineError::InvalidSnapshot(format!(
                    "open position {} carries exit fields",
                    position.symbol
                )));
            }
            if open_map.contains_key(&position.symbol) {
                return Err(EngineError::InvalidSnapshot(format!(
                    "duplicate open position for {}",
                    position.symbol
                )));
            }
            open_map.insert(position.symbol.clone(), position);
        }

        for trade in &closed_trades {
            trade
                .validate()
                .map_err(|err| EngineError::InvalidSnapshot(err.to_string()))?;
            if !trade.is_closed() {
                return Err(EngineError::InvalidSnapshot(format!(
                    "closed trade {} has no exit",
                    trade.id
                )));
            }
        }

        if open_map.len() > self.max_positions {
            warn!(
                "Restored {} open positions above the limit of {}; admission paused until below it",
                open_map.len(),
                self.max_positions
            );
        }

        self.capital = capital;
        self.open_positions = open_map;
        self.closed_trades = closed_trades;
        Ok(())
    }
}
