use crate::error::EngineError;
use crate::models::{Bar, ExitReason, Position};

/// Risk-based share count: `capital * risk_per_trade * confidence` divided by
/// the per-share distance to the stop, capped so the order is affordable.
///
/// Zero means "no trade" (degenerate stop, no capital or a price that does
/// not buy a single share).
pub fn size_position(
    capital: f64,
    risk_per_trade: f64,
    confidence: f64,
    entry_price: f64,
    stop_price: f64,
) -> u32 {
    if !capital.is_finite() || capital <= 0.0 {
        return 0;
    }
    if !entry_price.is_finite() || entry_price <= 0.0 || !stop_price.is_finite() {
        return 0;
    }

    let risk_amount = capital * risk_per_trade.max(0.0) * confidence.clamp(0.0, 1.0);
    let risk_per_share = (entry_price - stop_price).abs();
    if risk_per_share <= 0.0 {
        return 0;
    }

    let desired = (risk_amount / risk_per_share).floor();
    let affordable = (capital / entry_price).floor();
    let shares = desired.min(affordable).max(0.0);
    if shares.is_finite() && shares <= u32::MAX as f64 {
        shares as u32
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPlan {
    pub take_profit: f64,
    pub stop_loss: f64,
}

/// Take profit scales with the predicted move, stop loss with volatility.
pub fn plan_exits(
    entry_price: f64,
    expected_return: f64,
    volatility_proxy: f64,
    tp_multiplier: f64,
    sl_multiplier: f64,
) -> ExitPlan {
    ExitPlan {
        take_profit: entry_price * (1.0 + expected_return.abs() * tp_multiplier),
        stop_loss: entry_price - volatility_proxy * sl_multiplier,
    }
}

impl ExitPlan {
    /// A long plan is usable only when `0 < stop < entry < take_profit`.
    pub fn validate(&self, symbol: &str, entry_price: f64) -> Result<(), EngineError> {
        let stop_ok = self.stop_loss.is_finite()
            && self.stop_loss > 0.0
            && self.stop_loss < entry_price;
        if !stop_ok {
            return Err(EngineError::DegenerateStop {
                symbol: symbol.to_string(),
                entry_price,
                stop_loss: self.stop_loss,
            });
        }
        if !(self.take_profit.is_finite() && self.take_profit > entry_price) {
            return Err(EngineError::InvalidPosition(format!(
                "{}: take profit {} must be above entry {}",
                symbol, self.take_profit, entry_price
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub exit_price: f64,
    pub reason: ExitReason,
}

/// Decides whether `position` closes on `bar`.
///
/// The stop is always checked first: when one bar spans both levels the
/// intrabar order is unknown, so the fill is assumed at the stop. Exits fill
/// at the level itself, never at the bar's open or close.
pub fn evaluate_exit(position: &Position, bar: &Bar) -> Option<ExitDecision> {
    if bar.low <= position.stop_loss {
        return Some(ExitDecision {
            exit_price: position.stop_loss,
            reason: ExitReason::StopLoss,
        });
    }
    if bar.high >= position.take_profit {
        return Some(ExitDecision {
            exit_price: position.take_profit,
            reason: ExitReason::TakeProfit,
        });
    }
    None
}
