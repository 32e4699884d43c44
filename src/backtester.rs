use crate::clock::{SimulationClock, SkipCounters};
use crate::config::{RunConfig, ScanFilter};
use crate::market_data::{DataFeed, TickSource};
use crate::models::{DecisionRecord, EquitySample, Position, ScanRecord};
use crate::performance::{BenchmarkComparison, PerformanceAnalyzer, PerformanceReport};
use crate::signals::{CandidateScanner, SignalProvider};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub run_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub ticks: usize,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub trades: Vec<Position>,
    pub equity_curve: Vec<EquitySample>,
    pub scans: Vec<ScanRecord>,
    pub decisions: Vec<DecisionRecord>,
    pub skip_counters: SkipCounters,
    pub performance: PerformanceReport,
    pub benchmark: Option<BenchmarkComparison>,
}

/// Historical replay over any tick source. Single-symbol and multi-symbol
/// runs differ only in the scanner passed in.
pub struct Backtester<'a> {
    config: RunConfig,
    filter: ScanFilter,
    feed: &'a dyn DataFeed,
    benchmark_symbol: Option<String>,
    progress: Option<ProgressBar>,
}

impl<'a> Backtester<'a> {
    pub fn new(config: RunConfig, filter: ScanFilter, feed: &'a dyn DataFeed) -> Self {
        Self {
            config,
            filter,
            feed,
            benchmark_symbol: None,
            progress: None,
        }
    }

    pub fn with_benchmark(mut self, symbol: impl Into<String>) -> Self {
        self.benchmark_symbol = Some(symbol.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Replays every tick, then force-closes what is still open at the last
    /// tick. A lookahead violation aborts the run with an error.
    pub fn run(
        &self,
        ticks: &mut dyn TickSource,
        scanner: &mut dyn CandidateScanner,
        provider: &dyn SignalProvider,
    ) -> Result<BacktestResult> {
        let started = Instant::now();
        let mut clock = SimulationClock::new(self.config.clone(), self.filter.clone());
        let mut first_tick = None;
        let mut last_tick = None;
        let mut tick_count = 0usize;

        while let Some(now) = ticks.next_tick() {
            clock
                .step(now, self.feed, scanner, provider)
                .with_context(|| format!("Replay aborted at {}", now))?;
            if first_tick.is_none() {
                first_tick = Some(now);
            }
            last_tick = Some(now);
            tick_count += 1;
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }

        let (Some(start), Some(end)) = (first_tick, last_tick) else {
            return Err(anyhow!("No ticks to replay"));
        };

        let forced = clock.finalize_replay(end);
        if !forced.is_empty() {
            info!("Closed {} positions at end of run", forced.len());
        }
        if let Some(progress) = &self.progress {
            progress.finish_and_clear();
        }

        let trades = clock.book().closed_trades().to_vec();
        let equity_curve = clock.equity_samples().to_vec();
        let performance = PerformanceAnalyzer::analyze(
            &trades,
            &equity_curve,
            self.config.initial_capital,
            self.config.periods_per_year,
        );
        let benchmark = self.benchmark(start, end, performance.total_return);

        let skips = clock.skip_counters();
        info!(
            "Replayed {} ticks ({} to {}) in {:.2}s: {} trades, return {:.2}%, sharpe {:.2}, max drawdown {:.2}%, {} skips",
            tick_count,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            started.elapsed().as_secs_f64(),
            performance.total_trades,
            performance.total_return * 100.0,
            performance.sharpe_ratio,
            performance.max_drawdown * 100.0,
            skips.total()
        );
        for (label, count) in skips.iter() {
            debug!("{} skips: {}", label, count);
        }
        if performance.insufficient_data {
            warn!("No closed trades; performance statistics are not meaningful");
        }

        Ok(BacktestResult {
            run_id: clock.run_id(),
            start,
            end,
            ticks: tick_count,
            initial_capital: self.config.initial_capital,
            final_capital: clock.book().capital(),
            trades,
            equity_curve,
            scans: clock.scans().to_vec(),
            decisions: clock.decisions().to_vec(),
            skip_counters: skips.clone(),
            performance,
            benchmark,
        })
    }

    fn benchmark(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        strategy_return: f64,
    ) -> Option<BenchmarkComparison> {
        let symbol = self.benchmark_symbol.as_deref()?;
        let bars = match self.feed.history(symbol, end) {
            Ok(bars) => bars,
            Err(err) => {
                warn!("Benchmark {} unavailable: {}", symbol, err);
                return None;
            }
        };
        let comparison = BenchmarkComparison::new(symbol, &bars, start, end, strategy_return);
        if comparison.is_none() {
            warn!("Benchmark {} has no bars between {} and {}", symbol, start, end);
        }
        comparison
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{HistoricalFeed, HistoricalTicks};
    use crate::models::{Bar, ExitReason, SignalAction, SignalDecision};
    use crate::signals::StaticScanner;
    use chrono::{Duration, TimeZone};

    struct AlwaysBuy;

    impl SignalProvider for AlwaysBuy {
        fn signal(&self, symbol: &str, _as_of: DateTime<Utc>, _history: &[Bar]) -> Result<SignalDecision> {
            Ok(SignalDecision {
                symbol: symbol.to_string(),
                action: SignalAction::Buy,
                confidence: 1.0,
                expected_return: 0.04,
                win_probability: 0.6,
                expected_value: 0.01,
                volatility_proxy: 1.0,
            })
        }
    }

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap() + Duration::days(offset)
    }

    fn flat_bars(symbol: &str, closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                symbol: symbol.to_string(),
                date: day(i as i64),
                open: close,
                high: close + 0.1,
                low: close - 0.1,
                close,
                volume: 1_000_000,
            })
            .collect()
    }

    #[test]
    fn replay_force_closes_at_end_and_reports() {
        let feed = HistoricalFeed::from_bars(flat_bars("ACME", &[50.0, 50.5, 51.0]));
        let mut ticks = HistoricalTicks::from_feed(&feed, None, None);
        let mut scanner = StaticScanner::new(["ACME"]);

        let result = Backtester::new(RunConfig::default(), ScanFilter::default(), &feed)
            .with_benchmark("ACME")
            .run(&mut ticks, &mut scanner, &AlwaysBuy)
            .unwrap();

        assert_eq!(result.ticks, 3);
        assert_eq!(result.equity_curve.len(), 3);
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, Some(ExitReason::EndOfRun));
        assert!((trade.exit_price.unwrap() - 51.0).abs() < 1e-9);
        assert!((result.final_capital - 10_100.0).abs() < 1e-9);
        assert!(!result.performance.insufficient_data);

        let benchmark = result.benchmark.unwrap();
        assert!((benchmark.buy_and_hold_return - (51.0 / 50.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_window_is_an_error() {
        let feed = HistoricalFeed::from_bars(flat_bars("ACME", &[50.0]));
        let mut ticks = HistoricalTicks::from_feed(&feed, Some(day(5)), None);
        let mut scanner = StaticScanner::new(["ACME"]);
        let outcome = Backtester::new(RunConfig::default(), ScanFilter::default(), &feed)
            .run(&mut ticks, &mut scanner, &AlwaysBuy);
        assert!(outcome.is_err());
    }
}
