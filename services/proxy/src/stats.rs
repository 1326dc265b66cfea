//! Traffic accounting.
//!
//! Forwarding tasks report transferred bytes through a bounded channel to a
//! single aggregator task. The aggregator owns the span counters and flushes
//! a direction when its span exceeds the byte threshold, and flushes every
//! non-zero span on a fixed interval. Flushes go to a [`StatsSink`]; the
//! production sink POSTs JSON to the collector URL from the active config.
//!
//! Stats are best effort: a full channel drops the sample, a failed POST is
//! logged, and in both cases the data path is unaffected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::ActiveConfig;

/// Default span size that triggers an immediate flush (strictly greater-than).
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 10;

/// Default interval of the time trigger.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity of the sample channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Timeout for a single stats POST.
const POST_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction of a byte transfer, relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to backend.
    Upload,
    /// Backend to client.
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bytes moved in one direction, reported by a forwarding task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSample {
    pub direction: Direction,
    pub bytes: u64,
}

/// One flushed span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    /// Proxy instance name.
    pub name: String,
    pub direction: Direction,
    /// Bytes accumulated since the previous flush of this direction.
    pub amount: u64,
}

impl TrafficReport {
    /// Collector payload: `{"name": ..., "<direction>": amount}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = json!({ "name": self.name });
        body[self.direction.as_str()] = json!(self.amount);
        body
    }
}

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// A span is flushed as soon as it exceeds this many bytes.
    pub flush_threshold: u64,
    /// Non-zero spans are flushed at this interval regardless of volume.
    pub flush_interval: Duration,
    /// Capacity of the sample channel.
    pub channel_capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Destination for flushed spans.
#[async_trait]
pub trait StatsSink: Send + Sync + 'static {
    async fn publish(&self, report: &TrafficReport) -> Result<()>;
}

/// Running totals since start. Written by the aggregator only.
#[derive(Debug, Default)]
pub struct TrafficTotals {
    upload: AtomicU64,
    download: AtomicU64,
    dropped_samples: AtomicU64,
}

impl TrafficTotals {
    pub fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
        }
    }

    fn add(&self, direction: Direction, bytes: u64) {
        let counter = match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`TrafficTotals`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalsSnapshot {
    pub upload: u64,
    pub download: u64,
    pub dropped_samples: u64,
}

/// Producer side of the stats channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<TrafficSample>,
    totals: Arc<TrafficTotals>,
}

impl StatsHandle {
    /// Create a handle whose samples go to the returned receiver instead of
    /// an aggregator.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TrafficSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            tx,
            totals: Arc::new(TrafficTotals::default()),
        };
        (handle, rx)
    }

    /// Report transferred bytes. Never waits; a full channel drops the sample.
    pub fn record(&self, direction: Direction, bytes: u64) {
        if bytes == 0 {
            return;
        }

        match self.tx.try_send(TrafficSample { direction, bytes }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(sample)) => {
                self.totals.dropped_samples.fetch_add(1, Ordering::Relaxed);
                debug!(
                    direction = %sample.direction,
                    bytes = sample.bytes,
                    "Stats channel full, sample dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Stats aggregator stopped, sample dropped");
            }
        }
    }

    /// Totals accumulated by the aggregator so far.
    pub fn totals(&self) -> TotalsSnapshot {
        self.totals.snapshot()
    }
}

/// Running aggregator task.
pub struct StatsWorker {
    task: JoinHandle<TotalsSnapshot>,
    shutdown_tx: watch::Sender<bool>,
}

impl StatsWorker {
    /// Stop the aggregator after a final flush and return its totals.
    pub async fn shutdown(self) -> TotalsSnapshot {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Wait for the aggregator to exit on its own (all handles dropped).
    pub async fn join(self) -> TotalsSnapshot {
        match self.task.await {
            Ok(totals) => totals,
            Err(e) => {
                warn!(error = %e, "Stats aggregator task failed");
                TotalsSnapshot::default()
            }
        }
    }
}

/// The single serialized owner of the span counters.
pub struct StatsAggregator<S> {
    name: String,
    config: StatsConfig,
    sink: S,
    rx: mpsc::Receiver<TrafficSample>,
    totals: Arc<TrafficTotals>,
    span_upload: u64,
    span_download: u64,
}

impl<S: StatsSink> StatsAggregator<S> {
    /// Spawn an aggregator and return the producer handle plus the worker.
    pub fn spawn(name: impl Into<String>, config: StatsConfig, sink: S) -> (StatsHandle, StatsWorker) {
        let (handle, rx) = StatsHandle::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let aggregator = Self {
            name: name.into(),
            config,
            sink,
            rx,
            totals: Arc::clone(&handle.totals),
            span_upload: 0,
            span_download: 0,
        };

        let task = tokio::spawn(aggregator.run(shutdown_rx));
        (handle, StatsWorker { task, shutdown_tx })
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TotalsSnapshot {
        let interval = self.config.flush_interval;
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            name = %self.name,
            flush_threshold = self.config.flush_threshold,
            flush_interval_secs = interval.as_secs_f64(),
            "Stats aggregator started"
        );

        loop {
            tokio::select! {
                sample = self.rx.recv() => match sample {
                    Some(sample) => self.absorb(sample).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush(Direction::Upload).await;
                    self.flush(Direction::Download).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Samples already queued at shutdown still count.
        while let Ok(sample) = self.rx.try_recv() {
            self.absorb(sample).await;
        }
        self.flush(Direction::Upload).await;
        self.flush(Direction::Download).await;

        let totals = self.totals.snapshot();
        info!(
            upload_total = totals.upload,
            download_total = totals.download,
            dropped_samples = totals.dropped_samples,
            "Stats aggregator stopped"
        );
        totals
    }

    async fn absorb(&mut self, sample: TrafficSample) {
        self.totals.add(sample.direction, sample.bytes);

        let threshold = self.config.flush_threshold;
        let span = self.span_mut(sample.direction);
        *span += sample.bytes;
        if *span > threshold {
            self.flush(sample.direction).await;
        }
    }

    /// Publish and reset one span. Zero spans are not published. The span is
    /// reset even when publishing fails.
    async fn flush(&mut self, direction: Direction) {
        let amount = std::mem::take(self.span_mut(direction));
        if amount == 0 {
            return;
        }

        let report = TrafficReport {
            name: self.name.clone(),
            direction,
            amount,
        };

        match self.sink.publish(&report).await {
            Ok(()) => debug!(direction = %direction, amount, "Traffic stats flushed"),
            Err(e) => warn!(direction = %direction, amount, error = %e, "Post traffic stats failed"),
        }
    }

    fn span_mut(&mut self, direction: Direction) -> &mut u64 {
        match direction {
            Direction::Upload => &mut self.span_upload,
            Direction::Download => &mut self.span_download,
        }
    }
}

/// POSTs reports to the `TrafficUrl` of the active configuration.
///
/// The URL is read at flush time, so a reload can enable, change or disable
/// reporting. Without a URL, publishing is a no-op.
pub struct HttpStatsSink {
    client: reqwest::Client,
    config: ActiveConfig,
}

impl HttpStatsSink {
    pub fn new(config: ActiveConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .context("Failed to build stats HTTP client")?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl StatsSink for HttpStatsSink {
    async fn publish(&self, report: &TrafficReport) -> Result<()> {
        let config = self.config.load();
        let Some(url) = config.stats_url() else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&report.to_json())
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("Collector returned status: {}", response.status());
        }

        Ok(())
    }
}
