use crate::models::{Bar, EquitySample, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// Standard deviations below this count as zero volatility.
const MIN_STD_DEV: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
    /// Fraction, always <= 0.
    pub max_drawdown: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub calmar_ratio: f64,
    pub final_equity: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub avg_win_percent: f64,
    pub avg_loss_percent: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub unique_symbols: usize,
    pub avg_days_held: f64,
    pub median_days_held: f64,
    pub exit_reasons: BTreeMap<String, usize>,
    pub insufficient_data: bool,
}

/// Strategy return against holding one symbol over the same window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkComparison {
    pub symbol: String,
    pub buy_and_hold_return: f64,
    pub strategy_return: f64,
    pub outperformance: f64,
}

impl BenchmarkComparison {
    pub fn new(
        symbol: &str,
        bars: &[Bar],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        strategy_return: f64,
    ) -> Option<Self> {
        let buy_and_hold_return = buy_and_hold_return(bars, start, end)?;
        Some(Self {
            symbol: symbol.to_string(),
            buy_and_hold_return,
            strategy_return,
            outperformance: strategy_return - buy_and_hold_return,
        })
    }
}

/// Return from the first close at or after `start` to the last close at or
/// before `end`. `bars` must be sorted by date.
pub fn buy_and_hold_return(bars: &[Bar], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let first = bars.iter().find(|bar| bar.date >= start && bar.date <= end)?;
    let last = bars
        .iter()
        .rev()
        .find(|bar| bar.date <= end && bar.date >= start)?;
    if first.close <= 0.0 {
        return None;
    }
    Some(last.close / first.close - 1.0)
}

pub struct PerformanceAnalyzer;

impl PerformanceAnalyzer {
    /// Never fails. With no closed trades the ratio statistics are zero and
    /// `insufficient_data` is set; drawdown and return still come from the
    /// equity curve.
    pub fn analyze(
        closed_trades: &[Position],
        equity_samples: &[EquitySample],
        initial_capital: f64,
        periods_per_year: f64,
    ) -> PerformanceReport {
        let mut pnls = Vec::with_capacity(closed_trades.len());
        let mut winning_percents = Vec::new();
        let mut losing_percents = Vec::new();
        let mut exit_reasons: BTreeMap<String, usize> = BTreeMap::new();

        for trade in closed_trades {
            let Some(pnl) = trade.pnl() else {
                continue;
            };
            let percent = trade.return_pct().unwrap_or(0.0) * 100.0;
            pnls.push(pnl);
            if pnl > 0.0 {
                winning_percents.push(percent);
            } else {
                losing_percents.push(percent);
            }
            if let Some(reason) = trade.exit_reason {
                *exit_reasons.entry(reason.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let total_trades = pnls.len();
        let insufficient_data = total_trades == 0;
        let wins = winning_percents.len();
        let losses = total_trades - wins;

        let gross_profit: f64 = pnls.iter().filter(|pnl| **pnl > 0.0).sum();
        let gross_loss: f64 = pnls.iter().filter(|pnl| **pnl <= 0.0).sum::<f64>().abs();

        let (win_rate, profit_factor, sharpe_ratio) = if insufficient_data {
            (0.0, 0.0, 0.0)
        } else {
            let profit_factor = if gross_loss > 0.0 {
                gross_profit / gross_loss
            } else {
                0.0
            };
            (
                wins as f64 / total_trades as f64,
                profit_factor,
                Self::calculate_sharpe_ratio(equity_samples, periods_per_year),
            )
        };

        let final_equity = equity_samples
            .last()
            .map(|sample| sample.total_equity)
            .unwrap_or_else(|| initial_capital + pnls.iter().sum::<f64>());
        let total_return = if initial_capital > 0.0 {
            final_equity / initial_capital - 1.0
        } else {
            0.0
        };

        let cagr = match (equity_samples.first(), equity_samples.last()) {
            (Some(first), Some(last)) => Self::calculate_cagr(
                initial_capital,
                final_equity,
                first.timestamp,
                last.timestamp,
            ),
            _ => 0.0,
        };
        let max_drawdown = Self::calculate_max_drawdown(equity_samples);
        let calmar_ratio = if max_drawdown < -f64::EPSILON {
            cagr / max_drawdown.abs()
        } else {
            0.0
        };

        let days_held: Vec<f64> = closed_trades
            .iter()
            .filter_map(Position::days_held)
            .map(|days| days as f64)
            .collect();

        PerformanceReport {
            total_trades,
            wins,
            losses,
            win_rate,
            profit_factor,
            sharpe_ratio,
            max_drawdown,
            total_return,
            cagr,
            calmar_ratio,
            final_equity,
            gross_profit,
            gross_loss,
            avg_win_percent: Self::average(&winning_percents),
            avg_loss_percent: Self::average(&losing_percents),
            best_trade: pnls.iter().copied().fold(None, |best: Option<f64>, pnl| {
                Some(best.map_or(pnl, |best| best.max(pnl)))
            })
            .unwrap_or(0.0),
            worst_trade: pnls.iter().copied().fold(None, |worst: Option<f64>, pnl| {
                Some(worst.map_or(pnl, |worst| worst.min(pnl)))
            })
            .unwrap_or(0.0),
            unique_symbols: closed_trades
                .iter()
                .map(|trade| trade.symbol.as_str())
                .collect::<HashSet<_>>()
                .len(),
            avg_days_held: Self::average(&days_held),
            median_days_held: Self::median(&days_held),
            exit_reasons,
            insufficient_data,
        }
    }

    fn calculate_cagr(
        initial_capital: f64,
        final_equity: f64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> f64 {
        if initial_capital <= 0.0 || !final_equity.is_finite() || end_date <= start_date {
            return 0.0;
        }

        let years = (end_date - start_date).num_seconds() as f64 / (365.25_f64 * 24.0 * 60.0 * 60.0);
        if years <= 0.0 {
            return 0.0;
        }

        let ratio = final_equity / initial_capital;
        if ratio <= 0.0 {
            return -1.0;
        }
        ratio.powf(1.0 / years) - 1.0
    }

    fn average(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    fn median(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    /// Per-sample returns of total equity, annualized with
    /// `sqrt(periods_per_year)`. No risk-free rate.
    pub fn calculate_sharpe_ratio(samples: &[EquitySample], periods_per_year: f64) -> f64 {
        if samples.len() < 3 {
            return 0.0;
        }

        let returns: Vec<f64> = samples
            .windows(2)
            .map(|window| {
                let prev = window[0].total_equity;
                if prev > 0.0 {
                    window[1].total_equity / prev - 1.0
                } else {
                    0.0
                }
            })
            .collect();

        let mean_return = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if !std_dev.is_finite() || std_dev < MIN_STD_DEV {
            return 0.0;
        }

        mean_return / std_dev * periods_per_year.max(0.0).sqrt()
    }

    /// Worst peak-to-trough decline as a fraction of the running peak.
    pub fn calculate_max_drawdown(samples: &[EquitySample]) -> f64 {
        let mut peak = f64::NEG_INFINITY;
        let mut max_drawdown: f64 = 0.0;
        for sample in samples {
            peak = peak.max(sample.total_equity);
            if peak > 0.0 {
                let drawdown = (sample.total_equity - peak) / peak;
                max_drawdown = max_drawdown.min(drawdown);
            }
        }
        max_drawdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, SignalSnapshot};
    use chrono::{Duration, TimeZone};

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 3, 21, 0, 0).unwrap() + Duration::days(offset)
    }

    fn samples(equity: &[f64]) -> Vec<EquitySample> {
        equity
            .iter()
            .enumerate()
            .map(|(i, &total_equity)| EquitySample {
                timestamp: day(i as i64),
                capital: total_equity,
                total_equity,
                open_position_count: 0,
            })
            .collect()
    }

    fn trade(symbol: &str, entry: f64, exit: f64, shares: u32, reason: ExitReason) -> Position {
        Position {
            id: format!("{}-{}", symbol, entry),
            symbol: symbol.to_string(),
            entry_time: day(0),
            entry_price: entry,
            shares,
            take_profit: entry * 1.5,
            stop_loss: entry * 0.5,
            signal: SignalSnapshot {
                expected_return: 0.02,
                confidence: 0.6,
                expected_value: 0.01,
            },
            exit_time: Some(day(4)),
            exit_price: Some(exit),
            exit_reason: Some(reason),
        }
    }

    #[test]
    fn zero_trades_flag_insufficient_data() {
        let report = PerformanceAnalyzer::analyze(&[], &samples(&[10_000.0, 10_100.0, 9_900.0]), 10_000.0, 252.0);
        assert!(report.insufficient_data);
        assert_eq!(report.win_rate, 0.0);
        assert_eq!(report.profit_factor, 0.0);
        assert_eq!(report.sharpe_ratio, 0.0);
        assert!((report.total_return + 0.01).abs() < 1e-9);
        assert!(report.max_drawdown < 0.0);
    }

    #[test]
    fn trade_statistics() {
        let trades = vec![
            trade("AAA", 10.0, 12.0, 100, ExitReason::TakeProfit),
            trade("BBB", 20.0, 19.0, 50, ExitReason::StopLoss),
            trade("AAA", 10.0, 9.0, 50, ExitReason::EndOfRun),
        ];
        let report = PerformanceAnalyzer::analyze(&trades, &[], 10_000.0, 252.0);

        assert!(!report.insufficient_data);
        assert_eq!(report.total_trades, 3);
        assert_eq!(report.wins, 1);
        assert_eq!(report.losses, 2);
        assert!((report.win_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((report.gross_profit - 200.0).abs() < 1e-9);
        assert!((report.gross_loss - 100.0).abs() < 1e-9);
        assert!((report.profit_factor - 2.0).abs() < 1e-9);
        assert!((report.best_trade - 200.0).abs() < 1e-9);
        assert!((report.worst_trade + 50.0).abs() < 1e-9);
        assert!((report.avg_win_percent - 20.0).abs() < 1e-9);
        assert_eq!(report.unique_symbols, 2);
        assert!((report.avg_days_held - 4.0).abs() < 1e-9);
        assert_eq!(report.exit_reasons.get("STOP_LOSS"), Some(&1));
        // No samples: final equity is capital plus realized pnl.
        assert!((report.final_equity - 10_100.0).abs() < 1e-9);
        assert!((report.total_return - 0.01).abs() < 1e-9);
    }

    #[test]
    fn no_losses_means_zero_profit_factor() {
        let trades = vec![trade("AAA", 10.0, 12.0, 10, ExitReason::TakeProfit)];
        let report = PerformanceAnalyzer::analyze(&trades, &[], 10_000.0, 252.0);
        assert_eq!(report.profit_factor, 0.0);
        assert_eq!(report.win_rate, 1.0);
    }

    #[test]
    fn sharpe_and_drawdown_follow_the_equity_curve() {
        let curve = samples(&[100.0, 110.0, 99.0, 108.9]);
        let returns = [0.1_f64, -0.1, 0.1];
        let mean = returns.iter().sum::<f64>() / 3.0;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / 2.0;
        let expected = mean / variance.sqrt() * 252.0_f64.sqrt();

        let sharpe = PerformanceAnalyzer::calculate_sharpe_ratio(&curve, 252.0);
        assert!((sharpe - expected).abs() < 1e-9);
        assert!((PerformanceAnalyzer::calculate_max_drawdown(&curve) + 0.1).abs() < 1e-9);

        let flat = samples(&[100.0, 100.0, 100.0]);
        assert_eq!(PerformanceAnalyzer::calculate_sharpe_ratio(&flat, 252.0), 0.0);
        assert_eq!(PerformanceAnalyzer::calculate_max_drawdown(&flat), 0.0);
    }

    #[test]
    fn buy_and_hold_uses_the_window_edges() {
        let bars: Vec<Bar> = [10.0, 11.0, 12.0, 15.0]
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: "SPY".to_string(),
                date: day(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1,
            })
            .collect();
        let value = buy_and_hold_return(&bars, day(1), day(2)).unwrap();
        assert!((value - (12.0 / 11.0 - 1.0)).abs() < 1e-9);

        let comparison = BenchmarkComparison::new("SPY", &bars, day(0), day(3), 0.6).unwrap();
        assert!((comparison.buy_and_hold_return - 0.5).abs() < 1e-9);
        assert!((comparison.outperformance - 0.1).abs() < 1e-9);
        assert!(buy_and_hold_return(&bars, day(10), day(12)).is_none());
    }
}
