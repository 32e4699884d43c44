use crate::models::{EquitySample, Position};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a run. Contains no save timestamp, so saving a
/// freshly loaded snapshot reproduces the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub version: u32,
    pub run_id: Uuid,
    pub initial_capital: f64,
    pub capital: f64,
    pub open_positions: Vec<Position>,
    pub closed_trades: Vec<Position>,
    pub equity_samples: Vec<EquitySample>,
    pub last_scan_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub last_prices: BTreeMap<String, f64>,
}

/// Durable key-value home for one engine snapshot.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<EngineSnapshot>>;
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// Pretty JSON file written through a temp file and a rename, so a crash
/// mid-write never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        let snapshot: EngineSnapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("State file {} is not valid JSON", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(anyhow!(
                "State file version mismatch (found {}, expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            ));
        }
        debug!(
            "Loaded state {} from {}: {} open, {} closed",
            snapshot.run_id,
            self.path.display(),
            snapshot.open_positions.len(),
            snapshot.closed_trades.len()
        );
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory {}", parent.display())
                })?;
            }
        }

        let temp_path = self.temp_path();
        let file = File::create(&temp_path)
            .with_context(|| format!("Unable to create {}", temp_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot)
            .context("Failed to serialize engine state")?;
        writer.flush().context("Failed to flush engine state")?;
        writer
            .get_ref()
            .sync_all()
            .context("Failed to sync engine state to disk")?;
        drop(writer);

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        debug!(
            "Saved state {} to {} (capital {:.2}, {} open)",
            snapshot.run_id,
            self.path.display(),
            snapshot.capital,
            snapshot.open_positions.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, SignalSnapshot};
    use chrono::TimeZone;

    fn position(symbol: &str, closed: bool) -> Position {
        let entry_time = Utc.with_ymd_and_hms(2024, 5, 1, 14, 35, 0).unwrap();
        let exit_time = entry_time + chrono::Duration::minutes(95);
        Position {
            id: crate::models::generate_position_id(symbol, entry_time),
            symbol: symbol.to_string(),
            entry_time,
            entry_price: 12.34,
            shares: 81,
            take_profit: 12.9,
            stop_loss: 11.1,
            signal: SignalSnapshot {
                expected_return: 0.0123,
                confidence: 0.61,
                expected_value: 0.0031,
            },
            exit_time: closed.then_some(exit_time),
            exit_price: closed.then_some(12.9),
            exit_reason: closed.then_some(ExitReason::TakeProfit),
        }
    }

    fn snapshot() -> EngineSnapshot {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 16, 10, 0).unwrap();
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            run_id: Uuid::new_v4(),
            initial_capital: 10_000.0,
            capital: 10_000.0 - 81.0 * 12.34 + 81.0 * (12.9 - 12.34),
            open_positions: vec![position("AAA", false)],
            closed_trades: vec![position("BBB", true)],
            equity_samples: vec![EquitySample {
                timestamp: at,
                capital: 9045.82,
                total_equity: 10_045.36,
                open_position_count: 1,
            }],
            last_scan_time: Some(at),
            candidates: vec!["AAA".to_string(), "CCC".to_string()],
            last_prices: BTreeMap::from([("AAA".to_string(), 12.3333333333333)]),
        }
    }

    #[test]
    fn load_save_load_is_stable() {
        let dir = std::env::temp_dir().join(format!("engine-state-{}", Uuid::new_v4()));
        let store = JsonFileStore::new(dir.join("state.json"));
        assert!(store.load().unwrap().is_none());

        let original = snapshot();
        store.save(&original).unwrap();
        let first_bytes = fs::read(store.path()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, original);
        store.save(&loaded).unwrap();
        let second_bytes = fs::read(store.path()).unwrap();
        assert_eq!(first_bytes, second_bytes);
        assert!(!store.temp_path().exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_other_versions() {
        let dir = std::env::temp_dir().join(format!("engine-state-{}", Uuid::new_v4()));
        let store = JsonFileStore::new(dir.join("state.json"));
        let mut future = snapshot();
        future.version = SNAPSHOT_VERSION + 1;
        store.save(&future).unwrap();
        assert!(store.load().is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
