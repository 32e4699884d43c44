use crate::commands::{build_scanner, ensure_file_exists};
use crate::config::{LiveSettings, RunConfig, ScanFilter};
use crate::live::{stop_channel, LiveTrader};
use crate::market_data::FileFeed;
use crate::persistence::JsonFileStore;
use crate::signals::MomentumSignalProvider;
use anyhow::{anyhow, Result};
use chrono::Duration;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

pub struct LiveArgs {
    pub data_file: PathBuf,
    pub symbols: Vec<String>,
    pub max_staleness_minutes: i64,
}

pub async fn run(
    config: RunConfig,
    filter: ScanFilter,
    settings: LiveSettings,
    args: LiveArgs,
) -> Result<()> {
    ensure_file_exists(&args.data_file, "Live market data file")?;
    let max_staleness = staleness_limit(args.max_staleness_minutes)?;
    let feed = Arc::new(FileFeed::new(&args.data_file, max_staleness));
    let store = Arc::new(JsonFileStore::new(&settings.state_file));
    info!("Persisting live state to {}", store.path().display());

    let mut trader = LiveTrader::new(
        config,
        filter,
        settings,
        feed,
        build_scanner(&args.symbols),
        Arc::new(MomentumSignalProvider::default()),
        store,
    );
    if trader.resume()? {
        info!(
            "Resumed with {} open positions",
            trader.clock().book().open_count()
        );
    }

    let (handle, stop) = stop_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, stopping after the current tick"),
            Err(err) => warn!("Failed to listen for Ctrl+C: {}", err),
        }
        handle.stop();
    });

    trader.run(stop).await?;
    let book = trader.clock().book();
    info!(
        "Live run stopped: capital {:.2}, {} open, {} closed",
        book.capital(),
        book.open_count(),
        book.closed_trades().len()
    );
    Ok(())
}

fn staleness_limit(minutes: i64) -> Result<Duration> {
    Duration::try_minutes(minutes.max(1))
        .ok_or_else(|| anyhow!("Max staleness of {} minutes is out of range", minutes))
}
