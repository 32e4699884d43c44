pub mod backtest;
pub mod live;
pub mod report;

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::market_data::normalize_symbol;
use crate::signals::{CandidateScanner, MomentumScanner, StaticScanner};

pub(crate) fn ensure_file_exists(path: &Path, what: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(anyhow!("{} not found at {}", what, path.display()))
}

/// A fixed list when symbols are given, the momentum scan otherwise.
pub(crate) fn build_scanner(symbols: &[String]) -> Box<dyn CandidateScanner> {
    let symbols: Vec<String> = symbols.iter().filter_map(|s| normalize_symbol(s)).collect();
    if symbols.is_empty() {
        Box::new(MomentumScanner)
    } else {
        Box::new(StaticScanner::new(symbols))
    }
}
