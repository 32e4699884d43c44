use crate::config::ScanFilter;
use crate::error::is_fatal_error;
use crate::indicators::{average_range, last_percent_change, simple_returns};
use crate::market_data::AsOfView;
use crate::models::{Bar, SignalAction, SignalDecision};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::debug;
use statrs::statistics::Statistics;

/// Produces a trading decision for one symbol from history cut at `as_of`.
/// Must be deterministic for identical inputs.
pub trait SignalProvider: Send + Sync {
    fn signal(&self, symbol: &str, as_of: DateTime<Utc>, history: &[Bar])
        -> Result<SignalDecision>;
}

/// Picks the symbols to evaluate for entry at a scan tick.
pub trait CandidateScanner: Send {
    fn scan(&mut self, view: &AsOfView<'_>, filter: &ScanFilter) -> Result<Vec<String>>;
}

/// Always returns the same symbols. A one-element list is a single-symbol run.
#[derive(Debug, Clone, Default)]
pub struct StaticScanner {
    symbols: Vec<String>,
}

impl StaticScanner {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }
}

impl CandidateScanner for StaticScanner {
    fn scan(&mut self, _view: &AsOfView<'_>, _filter: &ScanFilter) -> Result<Vec<String>> {
        Ok(self.symbols.clone())
    }
}

/// Top movers by last-bar percent change within a price band and above a
/// volume floor.
#[derive(Debug, Clone, Default)]
pub struct MomentumScanner;

impl CandidateScanner for MomentumScanner {
    fn scan(&mut self, view: &AsOfView<'_>, filter: &ScanFilter) -> Result<Vec<String>> {
        let mut movers: Vec<(String, f64)> = Vec::new();

        for symbol in view.symbols() {
            // Only symbols with a bar at the scan tick qualify.
            let last = match view.bar(&symbol) {
                Ok(Some(bar)) => bar,
                Ok(None) => continue,
                Err(err) if is_fatal_error(&err) => return Err(err),
                Err(err) => {
                    debug!("Scanner skipped {}: {}", symbol, err);
                    continue;
                }
            };
            if last.close < filter.min_price || last.close > filter.max_price {
                continue;
            }
            if last.volume < filter.min_volume {
                continue;
            }
            let history = match view.history(&symbol) {
                Ok(history) => history,
                Err(err) if is_fatal_error(&err) => return Err(err),
                Err(err) => {
                    debug!("Scanner skipped {}: {}", symbol, err);
                    continue;
                }
            };
            let Some(change) = last_percent_change(&history) else {
                continue;
            };
            if change >= filter.min_percent_change {
                movers.push((symbol, change));
            }
        }

        movers.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        movers.truncate(filter.top_n);
        Ok(movers.into_iter().map(|(symbol, _)| symbol).collect())
    }
}

/// Reference provider built from recent daily returns.
///
/// Expected return is the mean of the last `lookback` returns, win
/// probability the share of up days, and the expected value
/// `p * avg_win - (1 - p) * avg_loss`. Confidence equals the win
/// probability. The volatility proxy is the mean high-low range over
/// `range_period` bars.
#[derive(Debug, Clone)]
pub struct MomentumSignalProvider {
    lookback: usize,
    range_period: usize,
}

impl Default for MomentumSignalProvider {
    fn default() -> Self {
        Self {
            lookback: 20,
            range_period: 14,
        }
    }
}

impl MomentumSignalProvider {
    pub fn new(lookback: usize, range_period: usize) -> Result<Self> {
        if lookback < 2 || range_period == 0 {
            return Err(anyhow!(
                "lookback must be >= 2 and range period >= 1 (got {} and {})",
                lookback,
                range_period
            ));
        }
        Ok(Self {
            lookback,
            range_period,
        })
    }

    pub fn min_history(&self) -> usize {
        (self.lookback + 1).max(self.range_period)
    }
}

impl SignalProvider for MomentumSignalProvider {
    fn signal(
        &self,
        symbol: &str,
        as_of: DateTime<Utc>,
        history: &[Bar],
    ) -> Result<SignalDecision> {
        if let Some(last) = history.last() {
            if last.date > as_of {
                return Err(anyhow!(
                    "history for {} ends at {} after {}",
                    symbol,
                    last.date,
                    as_of
                ));
            }
        }
        if history.len() < self.min_history() {
            return Ok(SignalDecision::no_trade(symbol));
        }

        let window = &history[history.len() - (self.lookback + 1)..];
        let returns = simple_returns(window);
        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns
            .iter()
            .copied()
            .filter(|r| *r < 0.0)
            .map(f64::abs)
            .collect();

        let win_probability = wins.len() as f64 / returns.len() as f64;
        let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().mean() };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().mean()
        };
        let expected_value = win_probability * avg_win - (1.0 - win_probability) * avg_loss;
        let expected_return = returns.iter().mean();

        let Some(volatility_proxy) =
            average_range(history, history.len() - 1, self.range_period)
        else {
            return Ok(SignalDecision::no_trade(symbol));
        };

        let action = if expected_return > 0.0 && expected_value > 0.0 {
            SignalAction::Buy
        } else {
            SignalAction::NoTrade
        };

        Ok(SignalDecision {
            symbol: symbol.to_string(),
            action,
            confidence: win_probability,
            expected_return,
            win_probability,
            expected_value,
            volatility_proxy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::HistoricalFeed;
    use chrono::{Duration, TimeZone};

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap() + Duration::days(offset)
    }

    fn series(symbol: &str, closes: &[f64], volume: u64) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: symbol.to_string(),
                date: day(i as i64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume,
            })
            .collect()
    }

    #[test]
    fn momentum_scanner_filters_and_ranks() {
        let mut bars = series("AAA", &[10.0, 10.5], 1_000_000);
        bars.extend(series("BBB", &[10.0, 11.0], 1_000_000));
        bars.extend(series("CCC", &[10.0, 12.0], 1_000)); // too thin
        bars.extend(series("DDD", &[50.0, 60.0], 1_000_000)); // too expensive
        bars.extend(series("EEE", &[10.0, 10.05], 1_000_000)); // too flat
        let feed = HistoricalFeed::from_bars(bars);
        let view = AsOfView::new(&feed, day(1));

        let picks = MomentumScanner.scan(&view, &ScanFilter::default()).unwrap();
        assert_eq!(picks, vec!["BBB".to_string(), "AAA".to_string()]);

        let filter = ScanFilter {
            top_n: 1,
            ..ScanFilter::default()
        };
        let picks = MomentumScanner.scan(&view, &filter).unwrap();
        assert_eq!(picks, vec!["BBB".to_string()]);
    }

    #[test]
    fn static_scanner_returns_its_list() {
        let feed = HistoricalFeed::default();
        let view = AsOfView::new(&feed, day(0));
        let picks = StaticScanner::new(["ACME"])
            .scan(&view, &ScanFilter::default())
            .unwrap();
        assert_eq!(picks, vec!["ACME".to_string()]);
    }

    #[test]
    fn provider_buys_a_steady_uptrend() {
        let mut closes = vec![10.0];
        for i in 1..30 {
            let step = if i % 4 == 3 { -0.005 } else { 0.01 };
            let prev = closes[i - 1];
            closes.push(prev * (1.0 + step));
        }
        let history = series("ACME", &closes, 1_000_000);
        let provider = MomentumSignalProvider::default();
        let decision = provider.signal("ACME", day(29), &history).unwrap();

        assert_eq!(decision.action, SignalAction::Buy);
        assert!(decision.expected_value > 0.0);
        assert!(decision.volatility_proxy > 0.0);
        assert!((0.0..=1.0).contains(&decision.confidence));
        assert_eq!(decision.confidence, decision.win_probability);
    }

    #[test]
    fn provider_declines_short_or_falling_history() {
        let provider = MomentumSignalProvider::default();
        let short = series("ACME", &[10.0, 11.0, 12.0], 1_000);
        assert_eq!(
            provider.signal("ACME", day(2), &short).unwrap().action,
            SignalAction::NoTrade
        );

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let history = series("ACME", &falling, 1_000);
        let decision = provider.signal("ACME", day(29), &history).unwrap();
        assert_eq!(decision.action, SignalAction::NoTrade);
        assert!(decision.expected_value < 0.0);
    }

    #[test]
    fn provider_rejects_history_past_the_cutoff() {
        let provider = MomentumSignalProvider::default();
        let history = series("ACME", &[10.0; 30], 1_000);
        assert!(provider.signal("ACME", day(5), &history).is_err());
    }
}
