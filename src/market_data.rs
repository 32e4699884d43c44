use crate::error::EngineError;
use crate::models::Bar;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

pub const MARKET_DATA_FILE_VERSION: u32 = 1;

/// Source of bars for the clock. `bar` answering `None` means "no data this
/// tick" and is never an error.
pub trait DataFeed: Send + Sync {
    fn symbols(&self) -> Vec<String>;

    /// Symbols with at least one bar at or before `as_of`.
    fn symbols_as_of(&self, as_of: DateTime<Utc>) -> Vec<String> {
        self.symbols()
            .into_iter()
            .filter(|symbol| {
                self.history(symbol, as_of)
                    .map(|bars| !bars.is_empty())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// The bar used for exits, entries and marking at tick `at`.
    fn bar(&self, symbol: &str, at: DateTime<Utc>) -> Option<Bar>;

    /// Bars up to and including `as_of`, oldest first.
    fn history(&self, symbol: &str, as_of: DateTime<Utc>) -> Result<Vec<Bar>>;

    /// Called once before each tick; live feeds reload here.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory per-symbol series, used for historical replay.
#[derive(Debug, Clone, Default)]
pub struct HistoricalFeed {
    series: BTreeMap<String, Vec<Bar>>,
}

impl HistoricalFeed {
    pub fn from_bars(bars: Vec<Bar>) -> Self {
        Self {
            series: group_bars_by_symbol(bars),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn series(&self, symbol: &str) -> Option<&[Bar]> {
        self.series.get(symbol).map(Vec::as_slice)
    }

    /// Every distinct bar timestamp across all symbols, ascending.
    pub fn unique_dates(&self) -> Vec<DateTime<Utc>> {
        let dates: BTreeSet<DateTime<Utc>> = self
            .series
            .values()
            .flat_map(|bars| bars.iter().map(|bar| bar.date))
            .collect();
        dates.into_iter().collect()
    }

    pub fn bar_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Latest bar at or before `at`.
    pub fn latest_bar(&self, symbol: &str, at: DateTime<Utc>) -> Option<&Bar> {
        let bars = self.series.get(symbol)?;
        let end = bars.partition_point(|bar| bar.date <= at);
        end.checked_sub(1).map(|idx| &bars[idx])
    }

    fn truncated(&self, symbol: &str, as_of: DateTime<Utc>) -> &[Bar] {
        match self.series.get(symbol) {
            Some(bars) => &bars[..bars.partition_point(|bar| bar.date <= as_of)],
            None => &[],
        }
    }
}

impl DataFeed for HistoricalFeed {
    fn symbols(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    fn symbols_as_of(&self, as_of: DateTime<Utc>) -> Vec<String> {
        self.series
            .iter()
            .filter(|(_, bars)| bars.first().is_some_and(|bar| bar.date <= as_of))
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    fn bar(&self, symbol: &str, at: DateTime<Utc>) -> Option<Bar> {
        let bars = self.series.get(symbol)?;
        bars.binary_search_by(|bar| bar.date.cmp(&at))
            .ok()
            .map(|idx| bars[idx].clone())
    }

    fn history(&self, symbol: &str, as_of: DateTime<Utc>) -> Result<Vec<Bar>> {
        Ok(self.truncated(symbol, as_of).to_vec())
    }
}

/// Feed backed by a market data file that an external fetcher keeps
/// rewriting. Reloaded on every `refresh`.
pub struct FileFeed {
    path: PathBuf,
    max_staleness: Duration,
    inner: RwLock<HistoricalFeed>,
}

impl FileFeed {
    pub fn new<P: AsRef<Path>>(path: P, max_staleness: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_staleness,
            inner: RwLock::new(HistoricalFeed::default()),
        }
    }
}

impl DataFeed for FileFeed {
    fn symbols(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|feed| feed.symbols())
            .unwrap_or_default()
    }

    fn symbols_as_of(&self, as_of: DateTime<Utc>) -> Vec<String> {
        self.inner
            .read()
            .map(|feed| feed.symbols_as_of(as_of))
            .unwrap_or_default()
    }

    fn bar(&self, symbol: &str, at: DateTime<Utc>) -> Option<Bar> {
        let feed = self.inner.read().ok()?;
        let bar = feed.latest_bar(symbol, at)?;
        if at - bar.date > self.max_staleness {
            debug!("Latest {} bar at {} is stale at {}", symbol, bar.date, at);
            return None;
        }
        Some(bar.clone())
    }

    fn history(&self, symbol: &str, as_of: DateTime<Utc>) -> Result<Vec<Bar>> {
        let feed = self
            .inner
            .read()
            .map_err(|_| anyhow!("market data lock poisoned"))?;
        feed.history(symbol, as_of)
    }

    fn refresh(&self) -> Result<()> {
        let file = MarketDataFile::load(&self.path)?;
        let feed = HistoricalFeed::from_bars(file.bars);
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow!("market data lock poisoned"))?;
        *guard = feed;
        Ok(())
    }
}

/// Read-only window over a feed that never hands out a bar stamped after
/// `as_of`. This is the only handle scanners and signal providers get.
pub struct AsOfView<'a> {
    feed: &'a dyn DataFeed,
    as_of: DateTime<Utc>,
    violation: Mutex<Option<EngineError>>,
}

impl<'a> AsOfView<'a> {
    pub fn new(feed: &'a dyn DataFeed, as_of: DateTime<Utc>) -> Self {
        Self {
            feed,
            as_of,
            violation: Mutex::new(None),
        }
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    /// Only symbols already listed at the cutoff.
    pub fn symbols(&self) -> Vec<String> {
        self.feed.symbols_as_of(self.as_of)
    }

    /// History up to the cutoff. A feed that returns later bars is a
    /// correctness bug: the bars are withheld and the violation is recorded.
    pub fn history(&self, symbol: &str) -> Result<Vec<Bar>> {
        let bars = self.feed.history(symbol, self.as_of)?;
        if let Some(late) = bars.iter().find(|bar| bar.date > self.as_of) {
            return Err(self.record(symbol, late.date).into());
        }
        Ok(bars)
    }

    /// The feed's bar for the cutoff tick, checked like `history`.
    pub fn bar(&self, symbol: &str) -> Result<Option<Bar>> {
        let Some(bar) = self.feed.bar(symbol, self.as_of) else {
            return Ok(None);
        };
        if bar.date > self.as_of {
            return Err(self.record(symbol, bar.date).into());
        }
        Ok(Some(bar))
    }

    fn record(&self, symbol: &str, bar_time: DateTime<Utc>) -> EngineError {
        let violation = EngineError::NoLookaheadViolation {
            symbol: symbol.to_string(),
            as_of: self.as_of,
            bar_time,
        };
        if let Ok(mut slot) = self.violation.lock() {
            slot.get_or_insert_with(|| violation.clone());
        }
        violation
    }

    pub fn take_violation(&self) -> Option<EngineError> {
        self.violation.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Ordered tick timestamps driving a run.
pub trait TickSource {
    fn next_tick(&mut self) -> Option<DateTime<Utc>>;
}

/// Replays a fixed list of dates in ascending order.
#[derive(Debug, Clone)]
pub struct HistoricalTicks {
    dates: Vec<DateTime<Utc>>,
    cursor: usize,
}

impl HistoricalTicks {
    pub fn new(mut dates: Vec<DateTime<Utc>>) -> Self {
        dates.sort();
        dates.dedup();
        Self { dates, cursor: 0 }
    }

    /// Every bar date of `feed` within the optional bounds.
    pub fn from_feed(
        feed: &HistoricalFeed,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        let dates = feed
            .unique_dates()
            .into_iter()
            .filter(|date| start.map_or(true, |start| *date >= start))
            .filter(|date| end.map_or(true, |end| *date <= end))
            .collect();
        Self::new(dates)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.dates.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.dates.last().copied()
    }
}

impl TickSource for HistoricalTicks {
    fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        let next = self.dates.get(self.cursor).copied();
        if next.is_some() {
            self.cursor += 1;
        }
        next
    }
}

/// Groups bars by symbol, each series sorted by date with duplicate
/// timestamps dropped (the later record wins).
pub fn group_bars_by_symbol(bars: Vec<Bar>) -> BTreeMap<String, Vec<Bar>> {
    let mut grouped: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
    for mut bar in bars {
        let Some(symbol) = normalize_symbol(&bar.symbol) else {
            continue;
        };
        bar.symbol = symbol.clone();
        grouped.entry(symbol).or_default().push(bar);
    }
    for series in grouped.values_mut() {
        series.sort_by(|a, b| a.date.cmp(&b.date));
        series.reverse();
        series.dedup_by(|later, earlier| later.date == earlier.date);
        series.reverse();
    }
    grouped.retain(|_, series| !series.is_empty());
    grouped
}

/// Trims and uppercases a symbol; empty input yields `None`.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Versioned on-disk bar set. `.json` files use JSON, anything else bincode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataFile {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub bars: Vec<Bar>,
}

impl MarketDataFile {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            version: MARKET_DATA_FILE_VERSION,
            generated_at: Utc::now(),
            bars,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open market data file at {}", path.display()))?;
        let reader = BufReader::new(file);
        let data: MarketDataFile = if is_json(path) {
            serde_json::from_reader(reader).context("Market data JSON decode failed")?
        } else {
            bincode::deserialize_from(reader).context("Market data decode failed")?
        };

        if data.version != MARKET_DATA_FILE_VERSION {
            return Err(anyhow!(
                "Market data file version mismatch (found {}, expected {})",
                data.version,
                MARKET_DATA_FILE_VERSION
            ));
        }
        debug!(
            "Loaded {} bars from {} (generated {})",
            data.bars.len(),
            path.display(),
            data.generated_at
        );
        Ok(data)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create market data directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!("Unable to create market data file at {}", path.display())
        })?;
        let mut writer = BufWriter::new(file);
        if is_json(path) {
            serde_json::to_writer(&mut writer, self)
                .context("Failed to serialize market data to JSON")?;
        } else {
            bincode::serialize_into(&mut writer, self)
                .context("Failed to serialize market data")?;
        }
        writer
            .flush()
            .context("Failed to flush market data file to disk")?;
        info!("Wrote {} bars to {}", self.bars.len(), path.display());
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap() + Duration::days(offset)
    }

    fn bar(symbol: &str, offset: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            date: day(offset),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000,
        }
    }

    struct LeakyFeed(HistoricalFeed);

    impl DataFeed for LeakyFeed {
        fn symbols(&self) -> Vec<String> {
            self.0.symbols()
        }

        fn bar(&self, symbol: &str, at: DateTime<Utc>) -> Option<Bar> {
            self.0.bar(symbol, at)
        }

        fn history(&self, symbol: &str, _as_of: DateTime<Utc>) -> Result<Vec<Bar>> {
            Ok(self.0.series(symbol).unwrap_or(&[]).to_vec())
        }
    }

    #[test]
    fn groups_sorts_and_normalizes() {
        let feed = HistoricalFeed::from_bars(vec![
            bar(" aaa ", 1, 11.0),
            bar("AAA", 0, 10.0),
            bar("BBB", 0, 20.0),
            bar("", 0, 1.0),
        ]);
        assert_eq!(feed.symbols(), vec!["AAA".to_string(), "BBB".to_string()]);
        let aaa = feed.series("AAA").unwrap();
        assert_eq!(aaa.len(), 2);
        assert!(aaa[0].date < aaa[1].date);
        assert_eq!(feed.unique_dates(), vec![day(0), day(1)]);
    }

    #[test]
    fn history_is_truncated_at_cutoff() {
        let feed = HistoricalFeed::from_bars((0..5).map(|i| bar("AAA", i, 10.0 + i as f64)).collect());
        let history = feed.history("AAA", day(2)).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|bar| bar.date <= day(2)));
        assert!(feed.bar("AAA", day(2)).is_some());
        assert!(feed.bar("AAA", day(2) + Duration::hours(1)).is_none());
        assert!(feed.bar("ZZZ", day(2)).is_none());
    }

    #[test]
    fn view_withholds_and_records_lookahead() {
        let leaky = LeakyFeed(HistoricalFeed::from_bars(
            (0..5).map(|i| bar("AAA", i, 10.0)).collect(),
        ));
        let view = AsOfView::new(&leaky, day(2));
        let err = view.history("AAA").unwrap_err();
        assert!(err.downcast_ref::<EngineError>().unwrap().is_fatal());
        assert!(matches!(
            view.take_violation(),
            Some(EngineError::NoLookaheadViolation { .. })
        ));
        assert!(view.take_violation().is_none());
    }

    #[test]
    fn view_hides_symbols_listed_after_cutoff() {
        let feed = HistoricalFeed::from_bars(vec![bar("OLD", 0, 10.0), bar("LATE", 30, 12.0)]);
        assert_eq!(AsOfView::new(&feed, day(0)).symbols(), vec!["OLD".to_string()]);
        assert_eq!(
            AsOfView::new(&feed, day(30)).symbols(),
            vec!["LATE".to_string(), "OLD".to_string()]
        );

        // Feeds without an override fall back to a history check.
        struct Plain(HistoricalFeed);
        impl DataFeed for Plain {
            fn symbols(&self) -> Vec<String> {
                self.0.symbols()
            }
            fn bar(&self, symbol: &str, at: DateTime<Utc>) -> Option<Bar> {
                self.0.bar(symbol, at)
            }
            fn history(&self, symbol: &str, as_of: DateTime<Utc>) -> Result<Vec<Bar>> {
                self.0.history(symbol, as_of)
            }
        }
        let plain = Plain(feed);
        assert_eq!(AsOfView::new(&plain, day(0)).symbols(), vec!["OLD".to_string()]);
    }

    #[test]
    fn historical_ticks_respect_bounds() {
        let feed = HistoricalFeed::from_bars((0..5).map(|i| bar("AAA", i, 10.0)).collect());
        let mut ticks = HistoricalTicks::from_feed(&feed, Some(day(1)), Some(day(3)));
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks.next_tick(), Some(day(1)));
        assert_eq!(ticks.next_tick(), Some(day(2)));
        assert_eq!(ticks.next_tick(), Some(day(3)));
        assert_eq!(ticks.next_tick(), None);
    }

    #[test]
    fn market_data_file_round_trips_in_both_formats() {
        let dir = std::env::temp_dir().join(format!("market-data-{}", uuid::Uuid::new_v4()));
        let bars: Vec<Bar> = (0..3).map(|i| bar("AAA", i, 10.0 + i as f64)).collect();
        let data = MarketDataFile::new(bars.clone());

        for name in ["bars.bin", "bars.json"] {
            let path = dir.join(name);
            data.save(&path).unwrap();
            let loaded = MarketDataFile::load(&path).unwrap();
            assert_eq!(loaded.bars, bars);
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_feed_serves_latest_fresh_bar() {
        let dir = std::env::temp_dir().join(format!("file-feed-{}", uuid::Uuid::new_v4()));
        let path = dir.join("live.json");
        MarketDataFile::new((0..3).map(|i| bar("AAA", i, 10.0 + i as f64)).collect())
            .save(&path)
            .unwrap();

        let feed = FileFeed::new(&path, Duration::days(1));
        assert!(feed.bar("AAA", day(2)).is_none());
        feed.refresh().unwrap();
        let latest = feed.bar("AAA", day(2) + Duration::hours(3)).unwrap();
        assert_eq!(latest.date, day(2));
        assert!(feed.bar("AAA", day(5)).is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
