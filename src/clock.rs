use crate::config::{RunConfig, ScanFilter};
use crate::error::{is_fatal_error, EngineError};
use crate::market_data::{AsOfView, DataFeed};
use crate::models::{
    AdmissionOutcome, Bar, DecisionRecord, EquitySample, ExitReason, Position, ScanRecord,
    SignalAction, SignalDecision, SkipReason, SkipStage, SymbolSkip,
};
use crate::persistence::{EngineSnapshot, SNAPSHOT_VERSION};
use crate::position_book::{OpenRequest, PositionBook};
use crate::signals::{CandidateScanner, SignalProvider};
use crate::trading_rules::{evaluate_exit, plan_exits, size_position};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Scanning,
    EvaluatingExits,
    AdmittingEntries,
    Sampling,
    Finalizing,
    Done,
}

/// Per-reason skip totals for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkipCounters {
    counts: BTreeMap<String, u64>,
}

impl SkipCounters {
    pub fn record(&mut self, reason: &SkipReason) {
        *self.counts.entry(reason.label().to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(label, count)| (label.as_str(), *count))
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub scanned: bool,
    pub closed: Vec<(String, ExitReason)>,
    pub opened: Vec<String>,
    pub skips: Vec<SymbolSkip>,
    pub sample: EquitySample,
}

impl TickReport {
    /// True when the tick scanned, opened or closed anything. The equity
    /// sample alone does not count.
    pub fn mutated_state(&self) -> bool {
        self.scanned || !self.closed.is_empty() || !self.opened.is_empty()
    }
}

/// Read-only result of looking at one admission candidate.
enum Evaluation {
    NoData,
    Failed(String),
    Decided { bar: Bar, decision: SignalDecision },
}

/// Drives one book through ticks: scan when due, evaluate exits, admit
/// entries, then record an equity sample. Used unchanged by replay and live
/// mode.
pub struct SimulationClock {
    config: RunConfig,
    filter: ScanFilter,
    run_id: Uuid,
    book: PositionBook,
    phase: Phase,
    candidates: Vec<String>,
    last_scan_time: Option<DateTime<Utc>>,
    last_prices: HashMap<String, f64>,
    equity_samples: Vec<EquitySample>,
    scans: Vec<ScanRecord>,
    decisions: Vec<DecisionRecord>,
    skip_counters: SkipCounters,
    stop_requested: bool,
}

impl SimulationClock {
    pub fn new(config: RunConfig, filter: ScanFilter) -> Self {
        let book = PositionBook::new(config.initial_capital, config.max_positions);
        Self {
            config,
            filter,
            run_id: Uuid::new_v4(),
            book,
            phase: Phase::Init,
            candidates: Vec::new(),
            last_scan_time: None,
            last_prices: HashMap::new(),
            equity_samples: Vec::new(),
            scans: Vec::new(),
            decisions: Vec::new(),
            skip_counters: SkipCounters::default(),
            stop_requested: false,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn last_scan_time(&self) -> Option<DateTime<Utc>> {
        self.last_scan_time
    }

    pub fn equity_samples(&self) -> &[EquitySample] {
        &self.equity_samples
    }

    pub fn scans(&self) -> &[ScanRecord] {
        &self.scans
    }

    pub fn decisions(&self) -> &[DecisionRecord] {
        &self.decisions
    }

    pub fn skip_counters(&self) -> &SkipCounters {
        &self.skip_counters
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    /// Halts admission from the next tick on. Exits keep being evaluated.
    pub fn request_stop(&mut self) {
        if !self.stop_requested {
            info!("Stop requested; no new entries will be admitted");
        }
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Clock phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn scan_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_scan_time {
            None => true,
            Some(last) => now - last >= self.config.scan_frequency,
        }
    }

    fn skip(&mut self, skips: &mut Vec<SymbolSkip>, symbol: &str, stage: SkipStage, reason: SkipReason) {
        debug!("{:?} skip for {}: {}", stage, symbol, reason.label());
        self.skip_counters.record(&reason);
        skips.push(SymbolSkip {
            symbol: symbol.to_string(),
            stage,
            reason,
        });
    }

    /// Runs one tick at `now`. Only a lookahead violation is returned as an
    /// error; every per-symbol failure is logged, counted and skipped.
    pub fn step(
        &mut self,
        now: DateTime<Utc>,
        feed: &dyn DataFeed,
        scanner: &mut dyn CandidateScanner,
        provider: &dyn SignalProvider,
    ) -> Result<TickReport> {
        if matches!(self.phase, Phase::Finalizing | Phase::Done) {
            return Err(anyhow::anyhow!("clock already finished at {:?}", self.phase));
        }

        let view = AsOfView::new(feed, now);
        let mut skips = Vec::new();

        self.enter(Phase::Scanning);
        let scanned = !self.stop_requested && self.scan_due(now) && self.run_scan(&view, scanner)?;

        self.enter(Phase::EvaluatingExits);
        let closed = self.evaluate_exits(&view, now, &mut skips)?;

        self.enter(Phase::AdmittingEntries);
        let opened = if self.stop_requested {
            Vec::new()
        } else {
            self.admit_entries(&view, now, provider, &mut skips)?
        };
        if let Some(violation) = view.take_violation() {
            return Err(violation.into());
        }

        self.enter(Phase::Sampling);
        let sample = self.record_sample(now);

        Ok(TickReport {
            at: now,
            scanned,
            closed,
            opened,
            skips,
            sample,
        })
    }

    fn run_scan(&mut self, view: &AsOfView<'_>, scanner: &mut dyn CandidateScanner) -> Result<bool> {
        let at = view.as_of();
        match scanner.scan(view, &self.filter) {
            Ok(symbols) => {
                let mut seen = HashSet::new();
                let symbols: Vec<String> = symbols
                    .into_iter()
                    .filter(|symbol| seen.insert(symbol.clone()))
                    .collect();
                info!("Scan at {} found {} candidates", at, symbols.len());
                self.candidates = symbols.clone();
                self.scans.push(ScanRecord { at, symbols });
                self.last_scan_time = Some(at);
            }
            Err(err) if is_fatal_error(&err) => return Err(err),
            Err(err) => {
                warn!("Scan at {} failed, keeping previous candidates: {}", at, err);
                return Ok(false);
            }
        }
        if let Some(violation) = view.take_violation() {
            return Err(violation.into());
        }
        Ok(true)
    }

    fn evaluate_exits(
        &mut self,
        view: &AsOfView<'_>,
        now: DateTime<Utc>,
        skips: &mut Vec<SymbolSkip>,
    ) -> Result<Vec<(String, ExitReason)>> {
        let mut closed = Vec::new();
        for symbol in self.book.open_symbols() {
            let bar = match view.bar(&symbol) {
                Ok(bar) => bar,
                Err(err) if is_fatal_error(&err) => return Err(err),
                Err(err) => {
                    self.skip(skips, &symbol, SkipStage::Exit, SkipReason::SignalError(err.to_string()));
                    continue;
                }
            };
            let Some(position) = self.book.position(&symbol) else {
                continue;
            };
            // A bar at or before entry was already priced into the open.
            let bar = match bar {
                Some(bar) if bar.date > position.entry_time => bar,
                _ => {
                    self.skip(skips, &symbol, SkipStage::Exit, SkipReason::NoData);
                    continue;
                }
            };

            let decision = evaluate_exit(position, &bar);
            self.last_prices.insert(symbol.clone(), bar.close);
            let Some(decision) = decision else {
                continue;
            };
            match self
                .book
                .close(&symbol, decision.exit_price, decision.reason, now)
            {
                Ok(_) => closed.push((symbol, decision.reason)),
                Err(err) => {
                    warn!("Failed to close {}: {}", symbol, err);
                    self.skip(skips, &symbol, SkipStage::Exit, SkipReason::Rejected(err.to_string()));
                }
            }
        }
        Ok(closed)
    }

    fn admit_entries(
        &mut self,
        view: &AsOfView<'_>,
        now: DateTime<Utc>,
        provider: &dyn SignalProvider,
        skips: &mut Vec<SymbolSkip>,
    ) -> Result<Vec<String>> {
        let pending: Vec<String> = self
            .candidates
            .iter()
            .filter(|symbol| !self.book.is_open(symbol))
            .cloned()
            .collect();
        if pending.is_empty() || !self.book.has_capacity() {
            return Ok(Vec::new());
        }

        // Evaluation is read-only and may fan out; opens stay in candidate order.
        let evaluations: Vec<Result<Evaluation>> = if self.config.parallel_signals {
            pending
                .par_iter()
                .map(|symbol| evaluate_candidate(symbol, view, provider))
                .collect()
        } else {
            Vec::new()
        };
        let mut evaluations = evaluations.into_iter();

        let mut opened = Vec::new();
        for symbol in pending {
            if !self.book.has_capacity() {
                break;
            }
            let evaluation = match evaluations.next() {
                Some(evaluation) => evaluation?,
                None => evaluate_candidate(&symbol, view, provider)?,
            };

            let (decision, outcome) = match evaluation {
                Evaluation::NoData => (None, Err(SkipReason::NoData)),
                Evaluation::Failed(message) => {
                    warn!("Signal for {} at {} failed: {}", symbol, now, message);
                    (None, Err(SkipReason::SignalError(message)))
                }
                Evaluation::Decided { bar, decision } => {
                    let outcome = self.try_open(&symbol, &bar, &decision, now);
                    (Some(decision), outcome)
                }
            };

            let outcome = match outcome {
                Ok(position) => {
                    self.last_prices.insert(symbol.clone(), position.entry_price);
                    opened.push(symbol.clone());
                    AdmissionOutcome::Opened {
                        shares: position.shares,
                        entry_price: position.entry_price,
                    }
                }
                Err(reason) => {
                    self.skip(skips, &symbol, SkipStage::Admission, reason.clone());
                    AdmissionOutcome::Skipped { reason }
                }
            };
            self.decisions.push(DecisionRecord {
                at: now,
                symbol,
                decision,
                outcome,
            });
        }
        Ok(opened)
    }

    fn try_open(
        &mut self,
        symbol: &str,
        bar: &Bar,
        decision: &SignalDecision,
        now: DateTime<Utc>,
    ) -> std::result::Result<Position, SkipReason> {
        if decision.action != SignalAction::Buy {
            return Err(SkipReason::NoTrade);
        }
        let passes = decision.expected_value > 0.0
            && decision.expected_value >= self.config.min_expected_value
            && decision.confidence >= self.config.min_confidence;
        if !passes {
            return Err(SkipReason::BelowThreshold);
        }

        let entry_price = bar.close;
        let plan = plan_exits(
            entry_price,
            decision.expected_return,
            decision.volatility_proxy,
            self.config.tp_multiplier,
            self.config.sl_multiplier,
        );
        match plan.validate(symbol, entry_price) {
            Ok(()) => {}
            Err(EngineError::DegenerateStop { .. }) => return Err(SkipReason::DegenerateStop),
            Err(err) => return Err(SkipReason::Rejected(err.to_string())),
        }

        let shares = size_position(
            self.book.capital(),
            self.config.risk_per_trade,
            decision.confidence,
            entry_price,
            plan.stop_loss,
        );
        if shares == 0 {
            return Err(SkipReason::ZeroShares);
        }

        self.book
            .open(
                OpenRequest {
                    symbol: symbol.to_string(),
                    entry_price,
                    shares,
                    take_profit: plan.take_profit,
                    stop_loss: plan.stop_loss,
                    signal: decision.snapshot(),
                },
                now,
            )
            .map_err(|err| SkipReason::Rejected(err.label().to_string()))
    }

    fn record_sample(&mut self, now: DateTime<Utc>) -> EquitySample {
        let book = &self.book;
        self.last_prices.retain(|symbol, _| book.is_open(symbol));
        let sample = EquitySample {
            timestamp: now,
            capital: self.book.capital(),
            total_equity: self.book.mark_to_market(&self.last_prices),
            open_position_count: self.book.open_count(),
        };
        self.equity_samples.push(sample);
        sample
    }

    /// Closes every open position at its last known price (entry price when
    /// it was never priced) with `END_OF_RUN`. Replay end only.
    pub fn finalize_replay(&mut self, at: DateTime<Utc>) -> Vec<Position> {
        self.enter(Phase::Finalizing);
        let mut closed = Vec::new();
        for symbol in self.book.open_symbols() {
            let Some(position) = self.book.position(&symbol) else {
                continue;
            };
            let price = self
                .last_prices
                .get(&symbol)
                .copied()
                .unwrap_or(position.entry_price);
            match self.book.close(&symbol, price, ExitReason::EndOfRun, at) {
                Ok(position) => closed.push(position),
                Err(err) => warn!("Failed to force-close {}: {}", symbol, err),
            }
        }
        self.last_prices.clear();
        self.enter(Phase::Done);
        closed
    }

    /// Ends a live run. Open positions stay open for the next session.
    pub fn finish_live(&mut self) {
        self.enter(Phase::Finalizing);
        info!(
            "Live run stopped with {} open positions and capital {:.2}",
            self.book.open_count(),
            self.book.capital()
        );
        self.enter(Phase::Done);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            run_id: self.run_id,
            initial_capital: self.config.initial_capital,
            capital: self.book.capital(),
            open_positions: self.book.open_positions().cloned().collect(),
            closed_trades: self.book.closed_trades().to_vec(),
            equity_samples: self.equity_samples.clone(),
            last_scan_time: self.last_scan_time,
            candidates: self.candidates.clone(),
            last_prices: self
                .last_prices
                .iter()
                .map(|(symbol, price)| (symbol.clone(), *price))
                .collect(),
        }
    }

    /// Replaces the run state with `snapshot`. Restoring the same snapshot
    /// again yields the same state.
    pub fn restore(&mut self, snapshot: &EngineSnapshot) -> Result<(), EngineError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::InvalidSnapshot(format!(
                "unsupported version {}",
                snapshot.version
            )));
        }
        self.book.restore(
            snapshot.capital,
            snapshot.open_positions.clone(),
            snapshot.closed_trades.clone(),
        )?;
        self.run_id = snapshot.run_id;
        self.config.initial_capital = snapshot.initial_capital;
        self.equity_samples = snapshot.equity_samples.clone();
        self.last_scan_time = snapshot.last_scan_time;
        self.candidates = snapshot.candidates.clone();
        self.last_prices = snapshot
            .last_prices
            .iter()
            .map(|(symbol, price)| (symbol.clone(), *price))
            .collect();
        info!(
            "Resumed run {}: capital {:.2}, {} open, {} closed",
            self.run_id,
            self.book.capital(),
            self.book.open_count(),
            self.book.closed_trades().len()
        );
        Ok(())
    }
}

fn evaluate_candidate(
    symbol: &str,
    view: &AsOfView<'_>,
    provider: &dyn SignalProvider,
) -> Result<Evaluation> {
    let bar = match view.bar(symbol) {
        Ok(Some(bar)) => bar,
        Ok(None) => return Ok(Evaluation::NoData),
        Err(err) if is_fatal_error(&err) => return Err(err),
        Err(err) => return Ok(Evaluation::Failed(err.to_string())),
    };
    let history = match view.history(symbol) {
        Ok(history) => history,
        Err(err) if is_fatal_error(&err) => return Err(err),
        Err(err) => return Ok(Evaluation::Failed(format!("{:#}", err))),
    };
    match provider.signal(symbol, view.as_of(), &history) {
        Ok(decision) => Ok(Evaluation::Decided { bar, decision }),
        Err(err) => Ok(Evaluation::Failed(format!("{:#}", err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::HistoricalFeed;
    use crate::signals::StaticScanner;
    use anyhow::anyhow;
    use chrono::{Duration, TimeZone};

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap() + Duration::days(offset)
    }

    fn bar(symbol: &str, offset: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            date: day(offset),
            open: close,
            high,
            low,
            close,
            volume: 1_000_000,
        }
    }

    /// Buys every symbol with fixed numbers: TP at +6%, SL at -4% of a 50 entry.
    struct FixedProvider;

    impl SignalProvider for FixedProvider {
        fn signal(&self, symbol: &str, _as_of: DateTime<Utc>, _history: &[Bar]) -> Result<SignalDecision> {
            if symbol == "FAIL" {
                return Err(anyhow!("model unavailable"));
            }
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

    fn config(max_positions: usize) -> RunConfig {
        RunConfig {
            max_positions,
            ..RunConfig::default()
        }
    }

    #[test]
    fn opens_then_exits_on_stop_before_take_profit() {
        let feed = HistoricalFeed::from_bars(vec![
            bar("ACME", 0, 50.5, 49.5, 50.0),
            bar("ACME", 1, 54.0, 47.0, 52.0),
        ]);
        let mut clock = SimulationClock::new(config(3), ScanFilter::default());
        let mut scanner = StaticScanner::new(["ACME"]);

        let first = clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();
        assert!(first.scanned);
        assert_eq!(first.opened, vec!["ACME".to_string()]);
        let position = clock.book().position("ACME").unwrap();
        assert_eq!(position.shares, 100);
        assert!((position.stop_loss - 48.0).abs() < 1e-9);
        assert!((position.take_profit - 53.0).abs() < 1e-9);
        assert!((clock.book().capital() - 5_000.0).abs() < 1e-9);
        assert!((first.sample.total_equity - 10_000.0).abs() < 1e-9);

        let second = clock.step(day(1), &feed, &mut scanner, &FixedProvider).unwrap();
        assert_eq!(second.closed, vec![("ACME".to_string(), ExitReason::StopLoss)]);
        assert!((clock.book().closed_trades()[0].exit_price.unwrap() - 48.0).abs() < 1e-9);
        // The freed slot is re-admitted at this tick's close after the exit.
        assert_eq!(second.opened, vec!["ACME".to_string()]);
        assert!((clock.book().position("ACME").unwrap().entry_price - 52.0).abs() < 1e-9);
        assert_eq!(clock.phase(), Phase::Sampling);
    }

    #[test]
    fn capacity_and_failures_are_skipped_not_fatal() {
        let feed = HistoricalFeed::from_bars(vec![
            bar("AAA", 0, 50.5, 49.5, 50.0),
            bar("FAIL", 0, 50.5, 49.5, 50.0),
            bar("BBB", 0, 50.5, 49.5, 50.0),
            bar("CCC", 0, 50.5, 49.5, 50.0),
        ]);
        let mut clock = SimulationClock::new(config(2), ScanFilter::default());
        let mut scanner = StaticScanner::new(["MISSING", "FAIL", "AAA", "BBB", "CCC"]);

        let report = clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();
        assert_eq!(report.opened, vec!["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(clock.book().open_count(), 2);
        assert_eq!(clock.skip_counters().get("no_data"), 1);
        assert_eq!(clock.skip_counters().get("signal_error"), 1);
        // CCC never evaluated once capacity was reached.
        assert_eq!(clock.decisions().len(), 4);
        assert!(clock.book().capital() >= 0.0);
    }

    #[test]
    fn parallel_signals_match_sequential() {
        let bars = vec![
            bar("AAA", 0, 10.5, 9.5, 10.0),
            bar("BBB", 0, 20.5, 19.5, 20.0),
            bar("CCC", 0, 30.5, 29.5, 30.0),
            bar("DDD", 0, 40.5, 39.5, 40.0),
            bar("FAIL", 0, 40.5, 39.5, 40.0),
        ];
        let feed = HistoricalFeed::from_bars(bars);
        let run = |parallel: bool| {
            let mut clock = SimulationClock::new(
                RunConfig {
                    parallel_signals: parallel,
                    ..config(3)
                },
                ScanFilter::default(),
            );
            let mut scanner = StaticScanner::new(["FAIL", "DDD", "CCC", "BBB", "AAA"]);
            clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();
            (clock.decisions().to_vec(), clock.equity_samples().to_vec())
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn missing_bar_keeps_position_and_values_it_at_last_price() {
        let feed = HistoricalFeed::from_bars(vec![
            bar("ACME", 0, 50.5, 49.5, 50.0),
            bar("ACME", 1, 51.5, 50.5, 51.0),
            bar("OTHER", 2, 10.0, 10.0, 10.0),
        ]);
        let mut clock = SimulationClock::new(config(3), ScanFilter::default());
        let mut scanner = StaticScanner::new(["ACME"]);

        clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();
        clock.step(day(1), &feed, &mut scanner, &FixedProvider).unwrap();
        let gap = clock.step(day(2), &feed, &mut scanner, &FixedProvider).unwrap();

        assert!(clock.book().is_open("ACME"));
        assert_eq!(gap.skips[0].reason, SkipReason::NoData);
        assert!((gap.sample.total_equity - (5_000.0 + 100.0 * 51.0)).abs() < 1e-9);
    }

    #[test]
    fn finalize_force_closes_at_last_known_price() {
        let feed = HistoricalFeed::from_bars(vec![
            bar("ACME", 0, 50.5, 49.5, 50.0),
            bar("ACME", 1, 51.5, 50.5, 51.0),
        ]);
        let mut clock = SimulationClock::new(config(3), ScanFilter::default());
        let mut scanner = StaticScanner::new(["ACME"]);
        clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();
        clock.step(day(1), &feed, &mut scanner, &FixedProvider).unwrap();

        let closed = clock.finalize_replay(day(1));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::EndOfRun));
        assert!((closed[0].exit_price.unwrap() - 51.0).abs() < 1e-9);
        assert!((clock.book().capital() - 10_100.0).abs() < 1e-9);
        assert_eq!(clock.phase(), Phase::Done);
        assert!(clock.step(day(2), &feed, &mut scanner, &FixedProvider).is_err());
    }

    #[test]
    fn stop_halts_admission_but_not_exits() {
        let feed = HistoricalFeed::from_bars(vec![
            bar("AAA", 0, 50.5, 49.5, 50.0),
            bar("AAA", 1, 53.5, 50.5, 53.0),
            bar("BBB", 1, 50.5, 49.5, 50.0),
        ]);
        let mut clock = SimulationClock::new(config(3), ScanFilter::default());
        let mut scanner = StaticScanner::new(["AAA", "BBB"]);
        clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();

        assert_eq!(clock.candidates(), ["AAA".to_string(), "BBB".to_string()]);

        clock.request_stop();
        assert!(clock.stop_requested());
        let report = clock.step(day(1), &feed, &mut scanner, &FixedProvider).unwrap();
        assert!(!report.scanned);
        assert_eq!(report.closed, vec![("AAA".to_string(), ExitReason::TakeProfit)]);
        assert!(report.opened.is_empty());
        assert!(!clock.book().is_open("BBB"));
    }

    #[test]
    fn scan_respects_frequency() {
        let feed = HistoricalFeed::from_bars((0..4).map(|i| bar("AAA", i, 1.0, 1.0, 1.0)).collect());
        let mut clock = SimulationClock::new(
            RunConfig {
                scan_frequency: Duration::days(2),
                ..config(3)
            },
            ScanFilter::default(),
        );
        let mut scanner = StaticScanner::new(Vec::<String>::new());
        let scanned: Vec<bool> = (0..4)
            .map(|i| clock.step(day(i), &feed, &mut scanner, &FixedProvider).unwrap().scanned)
            .collect();
        assert_eq!(scanned, vec![true, false, true, false]);
        assert_eq!(clock.scans().len(), 2);
    }

    #[test]
    fn snapshot_restore_is_a_replace() {
        let feed = HistoricalFeed::from_bars(vec![bar("ACME", 0, 50.5, 49.5, 50.0)]);
        let mut clock = SimulationClock::new(config(3), ScanFilter::default());
        let mut scanner = StaticScanner::new(["ACME"]);
        clock.step(day(0), &feed, &mut scanner, &FixedProvider).unwrap();
        let snapshot = clock.snapshot();

        let mut resumed = SimulationClock::new(config(3), ScanFilter::default());
        resumed.restore(&snapshot).unwrap();
        resumed.restore(&snapshot).unwrap();
        assert_eq!(resumed.snapshot(), snapshot);
        assert!((resumed.book().capital() - 5_000.0).abs() < 1e-9);
    }
}
