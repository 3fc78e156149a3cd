//! Byte counters tapped at each stage boundary and the periodic reporter that
//! turns them into rate, percentage and ETA.
//!
//! Producers only ever touch atomics. Snapshots travel to the sink over a
//! capacity-1 channel with `try_send`, so a slow sink loses intermediate
//! snapshots instead of slowing the pipeline down.

use crate::backup::pipeline::cancel::Cancellation;
use bon::Builder;
use bytesize::ByteSize;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use validator::Validate;

fn default_progress_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_progress_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct ProgressConfig {
    #[serde(default = "default_progress_enabled")]
    #[builder(default = default_progress_enabled())]
    #[getset(get_copy = "pub")]
    enabled: bool,

    /// Time between two snapshots
    #[serde(default = "default_progress_interval")]
    #[serde(with = "humantime_serde")]
    #[builder(default = default_progress_interval())]
    #[getset(get_copy = "pub")]
    interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_progress_enabled(),
            interval: default_progress_interval(),
        }
    }
}

/// Cumulative byte counters, one per stage boundary
#[derive(Debug, Default)]
pub struct ProgressCounters {
    read: AtomicU64,
    encrypted: AtomicU64,
    uploaded: AtomicU64,
    parts: AtomicU64,
}

impl ProgressCounters {
    pub fn add_read(&self, bytes: u64) {
        self.read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_encrypted(&self, bytes: u64) {
        self.encrypted.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one acknowledged part of `bytes` length.
    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.parts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_encrypted(&self) -> u64 {
        self.encrypted.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn parts_uploaded(&self) -> u64 {
        self.parts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Getters, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ProgressSnapshot {
    bytes_read: u64,
    bytes_encrypted: u64,
    bytes_uploaded: u64,
    parts_uploaded: u64,

    /// Bytes per second over the last tick
    read_rate: f64,
    encrypt_rate: f64,
    upload_rate: f64,

    elapsed: Duration,

    /// Expected archive size, when the source was pre-scanned
    estimated_total: Option<u64>,
}

impl ProgressSnapshot {
    fn capture(
        counters: &ProgressCounters,
        previous: Option<&ProgressSnapshot>,
        tick: Duration,
        elapsed: Duration,
        estimated_total: Option<u64>,
    ) -> Self {
        let (bytes_read, bytes_encrypted, bytes_uploaded) = (
            counters.bytes_read(),
            counters.bytes_encrypted(),
            counters.bytes_uploaded(),
        );
        let rate = |now: u64, before: Option<u64>| {
            let secs = tick.as_secs_f64();
            if secs <= 0.0 {
                return 0.0;
            }
            now.saturating_sub(before.unwrap_or(0)) as f64 / secs
        };
        Self {
            bytes_read,
            bytes_encrypted,
            bytes_uploaded,
            parts_uploaded: counters.parts_uploaded(),
            read_rate: rate(bytes_read, previous.map(|p| p.bytes_read)),
            encrypt_rate: rate(bytes_encrypted, previous.map(|p| p.bytes_encrypted)),
            upload_rate: rate(bytes_uploaded, previous.map(|p| p.bytes_uploaded)),
            elapsed,
            estimated_total,
        }
    }

    /// Share of the estimated archive that has been read, capped at 100.
    pub fn percent(&self) -> Option<f64> {
        match self.estimated_total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_read as f64 * 100.0 / total as f64).min(100.0)),
            None => None,
        }
    }

    /// Time left at the current read rate.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.estimated_total?;
        if self.read_rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_read);
        Some(Duration::from_secs_f64(remaining as f64 / self.read_rate))
    }
}

/// Receives snapshots on the reporter's sink thread
pub trait ProgressSink: Send {
    fn report(&mut self, snapshot: &ProgressSnapshot);
}

/// Logs every snapshot at info level
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&mut self, snapshot: &ProgressSnapshot) {
        let rate = |r: f64| ByteSize::b(r as u64);
        let position = match (snapshot.percent(), snapshot.eta()) {
            (Some(percent), Some(eta)) => format!(
                "{:.1}%, ETA {}",
                percent,
                humantime::format_duration(Duration::from_secs(eta.as_secs()))
            ),
            (Some(percent), None) => format!("{:.1}%", percent),
            _ => "size unknown".to_string(),
        };
        tracing::info!(
            "Progress {}: read {} ({}/s), encrypted {} ({}/s), uploaded {} in {} part(s) ({}/s), elapsed {}",
            position,
            ByteSize::b(snapshot.bytes_read),
            rate(snapshot.read_rate),
            ByteSize::b(snapshot.bytes_encrypted),
            rate(snapshot.encrypt_rate),
            ByteSize::b(snapshot.bytes_uploaded),
            snapshot.parts_uploaded,
            rate(snapshot.upload_rate),
            humantime::format_duration(Duration::from_secs(snapshot.elapsed.as_secs())),
        );
    }
}

/// Periodically snapshots shared counters into a sink
#[derive(Debug, Clone, Builder, Getters)]
pub struct ProgressReporter {
    #[getset(get = "pub")]
    counters: Arc<ProgressCounters>,
    interval: Duration,
    estimated_total: Option<u64>,
}

/// Running reporter; [`ProgressHandle::finish`] stops it and emits a last snapshot
pub struct ProgressHandle {
    stop: Cancellation,
    ticker: JoinHandle<()>,
    sink: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn<S: ProgressSink + 'static>(&self, mut sink: S) -> std::io::Result<ProgressHandle> {
        let (tx, rx) = sync_channel::<ProgressSnapshot>(1);
        let sink = std::thread::Builder::new()
            .name("progress-sink".into())
            .spawn(move || {
                for snapshot in rx {
                    sink.report(&snapshot);
                }
            })?;

        let stop = Cancellation::default();
        let ticker_stop = stop.clone();
        let reporter = self.clone();
        let ticker = std::thread::Builder::new()
            .name("progress-ticker".into())
            .spawn(move || {
                let started = Instant::now();
                let mut last_tick = started;
                let mut previous: Option<ProgressSnapshot> = None;
                loop {
                    let stopped = ticker_stop.sleep(reporter.interval);
                    let now = Instant::now();
                    let snapshot = ProgressSnapshot::capture(
                        &reporter.counters,
                        previous.as_ref(),
                        now - last_tick,
                        now - started,
                        reporter.estimated_total,
                    );
                    last_tick = now;
                    if stopped {
                        // the last snapshot is worth waiting for
                        let _ = tx.send(snapshot);
                        break;
                    }
                    match tx.try_send(snapshot.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::trace!("Progress sink busy, dropping snapshot")
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                    previous = Some(snapshot);
                }
            })?;

        Ok(ProgressHandle { stop, ticker, sink })
    }
}

impl ProgressHandle {
    pub fn finish(self) {
        self.stop.cancel();
        if self.ticker.join().is_err() {
            tracing::warn!("Progress ticker panicked");
        }
        if self.sink.join().is_err() {
            tracing::warn!("Progress sink panicked");
        }
    }
}
