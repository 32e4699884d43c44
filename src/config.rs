use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveTime};
use std::collections::HashMap;
use std::path::PathBuf;

/// Parameters of one simulation run, shared by replay and live mode.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub initial_capital: f64,
    pub risk_per_trade: f64,
    pub max_positions: usize,
    pub tp_multiplier: f64,
    pub sl_multiplier: f64,
    pub min_expected_value: f64,
    pub min_confidence: f64,
    pub scan_frequency: Duration,
    pub periods_per_year: f64,
    /// Fetch signals for all candidates on the rayon pool before admitting.
    pub parallel_signals: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            risk_per_trade: 0.02,
            max_positions: 3,
            tp_multiplier: 1.5,
            sl_multiplier: 2.0,
            min_expected_value: 0.0003,
            min_confidence: 0.48,
            scan_frequency: Duration::days(1),
            periods_per_year: 252.0,
            parallel_signals: false,
        }
    }
}

impl RunConfig {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let initial_capital = setting_f64(
            settings,
            "INITIAL_CAPITAL",
            defaults.initial_capital,
            Some(0.0),
            None,
        )?;
        let risk_per_trade = setting_f64(
            settings,
            "RISK_PER_TRADE",
            defaults.risk_per_trade,
            Some(0.0),
            Some(1.0),
        )?;
        let max_positions = setting_usize(settings, "MAX_POSITIONS", defaults.max_positions, 1)?;
        let tp_multiplier = setting_f64(
            settings,
            "TP_MULTIPLIER",
            defaults.tp_multiplier,
            Some(0.0),
            None,
        )?;
        let sl_multiplier = setting_f64(
            settings,
            "SL_MULTIPLIER",
            defaults.sl_multiplier,
            Some(0.0),
            None,
        )?;
        let min_expected_value = setting_f64(
            settings,
            "MIN_EXPECTED_VALUE",
            defaults.min_expected_value,
            None,
            None,
        )?;
        let min_confidence = setting_f64(
            settings,
            "MIN_CONFIDENCE",
            defaults.min_confidence,
            Some(0.0),
            Some(1.0),
        )?;
        // SCAN_FREQUENCY_MINUTES takes precedence over SCAN_FREQUENCY_DAYS.
        let scan_frequency = if lookup(settings, "SCAN_FREQUENCY_MINUTES").is_some() {
            setting_duration(settings, "SCAN_FREQUENCY_MINUTES", 0, 0, Duration::try_minutes)?
        } else {
            setting_duration(settings, "SCAN_FREQUENCY_DAYS", 1, 0, Duration::try_days)?
        };
        let periods_per_year = setting_f64(
            settings,
            "PERIODS_PER_YEAR",
            defaults.periods_per_year,
            Some(1.0),
            None,
        )?;
        let parallel_signals = setting_bool(settings, "PARALLEL_SIGNALS", false)?;

        if initial_capital <= 0.0 {
            return Err(anyhow!(
                "Setting INITIAL_CAPITAL must be > 0 (value: {})",
                initial_capital
            ));
        }

        Ok(Self {
            initial_capital,
            risk_per_trade,
            max_positions,
            tp_multiplier,
            sl_multiplier,
            min_expected_value,
            min_confidence,
            scan_frequency,
            periods_per_year,
            parallel_signals,
        })
    }
}

/// Momentum scan filter applied by the reference scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    pub min_price: f64,
    pub max_price: f64,
    pub min_percent_change: f64,
    pub min_volume: u64,
    pub top_n: usize,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            min_price: 2.0,
            max_price: 20.0,
            min_percent_change: 1.0,
            min_volume: 500_000,
            top_n: 3,
        }
    }
}

impl ScanFilter {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let min_price =
            setting_f64(settings, "SCAN_MIN_PRICE", defaults.min_price, Some(0.0), None)?;
        let max_price =
            setting_f64(settings, "SCAN_MAX_PRICE", defaults.max_price, Some(0.0), None)?;
        let min_percent_change = setting_f64(
            settings,
            "SCAN_MIN_PERCENT_CHANGE",
            defaults.min_percent_change,
            None,
            None,
        )?;
        let min_volume =
            setting_usize(settings, "SCAN_MIN_VOLUME", defaults.min_volume as usize, 0)? as u64;
        let top_n = setting_usize(settings, "SCAN_TOP_N", defaults.top_n, 1)?;

        if max_price < min_price {
            return Err(anyhow!(
                "SCAN_MAX_PRICE ({}) must be >= SCAN_MIN_PRICE ({})",
                max_price,
                min_price
            ));
        }

        Ok(Self {
            min_price,
            max_price,
            min_percent_change,
            min_volume,
            top_n,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub poll_interval: Duration,
    /// UTC window outside of which ticks are ignored.
    pub trading_window: Option<(NaiveTime, NaiveTime)>,
    pub state_file: PathBuf,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::minutes(5),
            trading_window: None,
            state_file: PathBuf::from("engine-state.json"),
        }
    }
}

impl LiveSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let poll_interval =
            setting_duration(settings, "POLL_INTERVAL_MINUTES", 5, 1, Duration::try_minutes)?;
        let open = lookup(settings, "MARKET_OPEN_UTC")
            .map(|raw| parse_time(raw, "MARKET_OPEN_UTC"))
            .transpose()?;
        let close = lookup(settings, "MARKET_CLOSE_UTC")
            .map(|raw| parse_time(raw, "MARKET_CLOSE_UTC"))
            .transpose()?;
        let trading_window = match (open, close) {
            (Some(open), Some(close)) if open < close => Some((open, close)),
            (Some(open), Some(close)) => {
                return Err(anyhow!(
                    "MARKET_OPEN_UTC ({}) must be before MARKET_CLOSE_UTC ({})",
                    open,
                    close
                ))
            }
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "MARKET_OPEN_UTC and MARKET_CLOSE_UTC must be set together"
                ))
            }
        };
        let state_file = lookup(settings, "STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("engine-state.json"));

        Ok(Self {
            poll_interval,
            trading_window,
            state_file,
        })
    }

    pub fn within_trading_window(&self, time: NaiveTime) -> bool {
        match self.trading_window {
            Some((open, close)) => open <= time && time <= close,
            None => true,
        }
    }
}

fn lookup<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_time(raw: &str, key: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| anyhow!("Setting {} must be a time in HH:MM format (value: {})", key, raw))
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = lookup(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_duration(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
    to_duration: fn(i64) -> Option<Duration>,
) -> Result<Duration> {
    let value = setting_usize(settings, key, default, min)?;
    i64::try_from(value)
        .ok()
        .and_then(to_duration)
        .ok_or_else(|| {
            anyhow!(
                "Setting {} is out of range (value: {})",
                key,
                lookup(settings, key).unwrap_or_default()
            )
        })
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = lookup(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn setting_bool(settings: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = lookup(settings, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Setting {} must be a boolean (value: {})", key, raw)),
    }
}
