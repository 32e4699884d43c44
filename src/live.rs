use crate::clock::{SimulationClock, TickReport};
use crate::config::{LiveSettings, RunConfig, ScanFilter};
use crate::market_data::DataFeed;
use crate::persistence::StateStore;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::signals::{CandidateScanner, SignalProvider};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Requests a live run to stop. Cloneable; any clone stops the run.
#[derive(Clone)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.sender.send(true);
    }
}

/// Observed by the polling loop.
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once a stop was requested, or when every handle is gone.
    pub async fn stopped(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        StopHandle {
            sender: Arc::new(sender),
        },
        StopSignal { receiver },
    )
}

/// Paper trading on a polling timer. Ticks that scan, open or close are
/// persisted; a stop halts admission, persists and returns with positions
/// left open.
pub struct LiveTrader {
    clock: SimulationClock,
    settings: LiveSettings,
    feed: Arc<dyn DataFeed>,
    scanner: Box<dyn CandidateScanner>,
    provider: Arc<dyn SignalProvider>,
    store: Arc<dyn StateStore>,
}

impl LiveTrader {
    pub fn new(
        config: RunConfig,
        filter: ScanFilter,
        settings: LiveSettings,
        feed: Arc<dyn DataFeed>,
        scanner: Box<dyn CandidateScanner>,
        provider: Arc<dyn SignalProvider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            clock: SimulationClock::new(config, filter),
            settings,
            feed,
            scanner,
            provider,
            store,
        }
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    /// Restores the persisted state if there is one. Safe to call again: the
    /// snapshot replaces the state instead of being added to it.
    pub fn resume(&mut self) -> Result<bool> {
        let Some(snapshot) = self.store.load()? else {
            info!("No saved state; starting fresh");
            return Ok(false);
        };
        self.clock
            .restore(&snapshot)
            .context("Saved engine state is invalid")?;
        Ok(true)
    }

    /// One poll. Returns `None` when `now` is outside the trading window or
    /// the feed could not be refreshed. Quiet ticks only add an equity
    /// sample, which reaches disk with the next persisted tick or on stop.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<Option<TickReport>> {
        if !self.settings.within_trading_window(now.time()) {
            debug!("{} is outside the trading window; skipping tick", now);
            return Ok(None);
        }
        if let Err(err) = self.feed.refresh() {
            warn!("Market data refresh failed at {}: {:#}", now, err);
            return Ok(None);
        }

        let report = self.clock.step(
            now,
            &*self.feed,
            &mut *self.scanner,
            &*self.provider,
        )?;
        if !report.closed.is_empty() || !report.opened.is_empty() {
            info!(
                "Tick {}: {} closed, {} opened, equity {:.2}",
                now,
                report.closed.len(),
                report.opened.len(),
                report.sample.total_equity
            );
        }
        if report.mutated_state() {
            self.persist().await?;
        }
        Ok(Some(report))
    }

    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.clock.snapshot();
        retry_with_backoff("Saving engine state", RetryPolicy::default(), || {
            self.store.save(&snapshot)
        })
        .await
    }

    /// Halts admission, persists and ends the run without closing positions.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.clock.request_stop();
        self.clock.finish_live();
        self.persist().await
    }

    /// Polls until `stop` fires. A tick already in progress completes
    /// (including its exits and persistence) before the loop exits.
    pub async fn run(&mut self, mut stop: StopSignal) -> Result<()> {
        let period = self
            .settings
            .poll_interval
            .to_std()
            .context("Poll interval must be positive")?;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Live polling every {}s", period.as_secs());

        loop {
            if stop.is_stopped() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await?;
                }
                _ = stop.stopped() => break,
            }
        }

        self.shutdown().await
    }
}
