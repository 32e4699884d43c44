use crate::commands::ensure_file_exists;
use crate::performance::PerformanceAnalyzer;
use crate::persistence::{JsonFileStore, StateStore};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::path::Path;

/// Prints the performance report of a persisted live run as JSON.
pub fn run(state_file: &Path, periods_per_year: f64) -> Result<()> {
    ensure_file_exists(state_file, "State file")?;
    let store = JsonFileStore::new(state_file);
    let snapshot = store
        .load()?
        .ok_or_else(|| anyhow!("State file {} is empty", state_file.display()))?;

    let report = PerformanceAnalyzer::analyze(
        &snapshot.closed_trades,
        &snapshot.equity_samples,
        snapshot.initial_capital,
        periods_per_year,
    );
    if report.insufficient_data {
        warn!("Run {} has no closed trades yet", snapshot.run_id);
    }
    info!(
        "Run {}: {} open positions, capital {:.2}",
        snapshot.run_id,
        snapshot.open_positions.len(),
        snapshot.capital
    );

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    println!("{}", json);
    Ok(())
}
