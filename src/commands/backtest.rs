use crate::backtester::Backtester;
use crate::commands::{build_scanner, ensure_file_exists};
use crate::config::{RunConfig, ScanFilter};
use crate::market_data::{DataFeed, HistoricalFeed, HistoricalTicks, MarketDataFile};
use crate::signals::MomentumSignalProvider;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::fs;
use std::path::PathBuf;

pub struct BacktestArgs {
    pub data_file: PathBuf,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub symbols: Vec<String>,
    pub benchmark: Option<String>,
    pub output: Option<PathBuf>,
}

pub fn run(config: RunConfig, filter: ScanFilter, args: BacktestArgs) -> Result<()> {
    ensure_file_exists(&args.data_file, "Market data file")?;
    let data = MarketDataFile::load(&args.data_file)?;
    let feed = HistoricalFeed::from_bars(data.bars);
    if feed.is_empty() {
        return Err(anyhow!("Market data file {} has no bars", args.data_file.display()));
    }
    info!(
        "Loaded {} bars for {} symbols",
        feed.bar_count(),
        feed.symbols().len()
    );

    let start = args.start.map(start_of_day).transpose()?;
    let end = args.end.map(end_of_day).transpose()?;
    let mut ticks = HistoricalTicks::from_feed(&feed, start, end);
    if ticks.is_empty() {
        return Err(anyhow!("No bars fall inside the requested window"));
    }

    let pb = ProgressBar::new(ticks.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let mut scanner = build_scanner(&args.symbols);
    let provider = MomentumSignalProvider::default();
    let mut backtester = Backtester::new(config, filter, &feed).with_progress(pb);
    if let Some(symbol) = &args.benchmark {
        backtester = backtester.with_benchmark(symbol.trim().to_uppercase());
    }
    let result = backtester.run(&mut ticks, &mut *scanner, &provider)?;

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize backtest result")?;
    match &args.output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("Failed to write backtest result to {}", path.display()))?;
            info!("Backtest result written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn start_of_day(date: NaiveDate) -> Result<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("Invalid start date {}", date))
}

fn end_of_day(date: NaiveDate) -> Result<DateTime<Utc>> {
    date.and_hms_opt(23, 59, 59)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("Invalid end date {}", date))
}
