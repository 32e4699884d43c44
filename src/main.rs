use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use portfolio_engine::commands::{backtest, live, report};
use portfolio_engine::config::{LiveSettings, RunConfig, ScanFilter};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "portfolio-engine")]
#[command(about = "Long-only portfolio simulation with replay and live paper trading")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a market data file and print the result as JSON
    Backtest {
        /// Path to the market data file (.bin or .json)
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// First day to replay (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day to replay (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Comma separated symbols to trade; the momentum scan picks them when empty
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Symbol used for the buy-and-hold comparison
        #[arg(long)]
        benchmark: Option<String>,
        /// Write the result here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Overrides INITIAL_CAPITAL
        #[arg(long)]
        capital: Option<f64>,
        /// Overrides MAX_POSITIONS
        #[arg(long)]
        max_positions: Option<usize>,
        /// Fetch signals on the rayon pool
        #[arg(long)]
        parallel: bool,
    },
    /// Paper trade against a bars file refreshed by an external fetcher
    Live {
        /// Path to the live market data file (.bin or .json)
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Overrides STATE_FILE
        #[arg(long = "state-file", value_name = "PATH")]
        state_file: Option<PathBuf>,
        /// Comma separated symbols to trade; the momentum scan picks them when empty
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Bars older than this are treated as missing
        #[arg(long, default_value_t = 1440)]
        max_staleness_minutes: i64,
    },
    /// Print the performance report of a saved live run
    Report {
        /// Overrides STATE_FILE
        #[arg(long = "state-file", value_name = "PATH")]
        state_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut settings: HashMap<String, String> = env::vars().collect();

    match cli.command {
        Commands::Backtest {
            data_file,
            start,
            end,
            symbols,
            benchmark,
            output,
            capital,
            max_positions,
            parallel,
        } => {
            if let Some(capital) = capital {
                settings.insert("INITIAL_CAPITAL".to_string(), capital.to_string());
            }
            if let Some(max_positions) = max_positions {
                settings.insert("MAX_POSITIONS".to_string(), max_positions.to_string());
            }
            if parallel {
                settings.insert("PARALLEL_SIGNALS".to_string(), "true".to_string());
            }
            let config = RunConfig::from_settings_map(&settings)?;
            let filter = ScanFilter::from_settings_map(&settings)?;
            info!("Starting backtest with {:?}", config);
            backtest::run(
                config,
                filter,
                backtest::BacktestArgs {
                    data_file: resolve_market_data_path(data_file),
                    start,
                    end,
                    symbols,
                    benchmark,
                    output,
                },
            )?;
        }
        Commands::Live {
            data_file,
            state_file,
            symbols,
            max_staleness_minutes,
        } => {
            if let Some(path) = state_file {
                settings.insert("STATE_FILE".to_string(), path.display().to_string());
            }
            let config = RunConfig::from_settings_map(&settings)?;
            let filter = ScanFilter::from_settings_map(&settings)?;
            let live_settings = LiveSettings::from_settings_map(&settings)?;
            info!("Starting live paper trading. Not financial advice.");
            live::run(
                config,
                filter,
                live_settings,
                live::LiveArgs {
                    data_file: resolve_market_data_path(data_file),
                    symbols,
                    max_staleness_minutes,
                },
            )
            .await?;
        }
        Commands::Report { state_file } => {
            let config = RunConfig::from_settings_map(&settings)?;
            let live_settings = LiveSettings::from_settings_map(&settings)?;
            let path = state_file.unwrap_or(live_settings.state_file);
            report::run(&path, config.periods_per_year)?;
        }
    }

    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE))
}
