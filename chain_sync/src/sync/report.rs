//! Periodic progress report.
//!
//! Polls feed counters and pool stats on a timer and turns them into
//! progress lines and gauges. Reads snapshots only; never touches feed or
//! selector state.
use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info};

use super::{
    mode::SyncMode,
    peer_pool::{PoolStats, SyncPeerPool},
    progress::{FeedProgress, ProgressSnapshot},
};
use crate::types::DataKind;

/// One feed's numbers at one report tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedSample {
    pub kind: DataKind,
    pub done: u64,
    pub total: u64,
    pub queued: u64,
    pub percent: f64,
    /// Items per second since the previous tick.
    pub current_rate: f64,
    /// Items per second since the range was reset.
    pub total_rate: f64,
}

impl FeedSample {
    pub fn render(&self) -> String {
        format!(
            "{:<12} {} / {} ({:.2}%) | queue {} | current {:.1}/s | total {:.1}/s",
            self.kind.phase_name(),
            self.done,
            self.total,
            self.percent,
            self.queued,
            self.current_rate,
            self.total_rate,
        )
    }
}

/// Destination for report output. Failures are logged and dropped.
pub trait ReportSink: Send + Sync {
    fn emit_line(&self, line: &str) -> Result<()>;

    fn record_feed(&self, _sample: &FeedSample) -> Result<()> {
        Ok(())
    }

    fn record_pool(&self, _stats: &PoolStats, _mode: SyncMode) -> Result<()> {
        Ok(())
    }
}

/// Writes progress lines to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit_line(&self, line: &str) -> Result<()> {
        info!("{line}");
        Ok(())
    }
}

impl ReportSink for metrics::Metrics {
    fn emit_line(&self, _line: &str) -> Result<()> {
        Ok(())
    }

    fn record_feed(&self, sample: &FeedSample) -> Result<()> {
        let kind = sample.kind.as_str();
        self.set_feed_progress(
            kind,
            i64::try_from(sample.done)?,
            i64::try_from(sample.total)?,
            i64::try_from(sample.queued)?,
        );
        self.set_feed_rate(kind, sample.current_rate);
        Ok(())
    }

    fn record_pool(&self, stats: &PoolStats, mode: SyncMode) -> Result<()> {
        self.set_peers(
            i64::try_from(stats.connected)?,
            i64::try_from(stats.initialized)?,
            i64::try_from(stats.banned)?,
        );
        self.set_sync_mode(i64::from(mode.bits()));
        Ok(())
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Arc<S> {
    fn emit_line(&self, line: &str) -> Result<()> {
        (**self).emit_line(line)
    }

    fn record_feed(&self, sample: &FeedSample) -> Result<()> {
        (**self).record_feed(sample)
    }

    fn record_pool(&self, stats: &PoolStats, mode: SyncMode) -> Result<()> {
        (**self).record_pool(stats, mode)
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    generation: u64,
    first_at: Instant,
    first_done: u64,
    last_at: Instant,
    last_done: u64,
}

impl Baseline {
    fn new(snapshot: &ProgressSnapshot, now: Instant) -> Self {
        Self {
            generation: snapshot.generation,
            first_at: now,
            first_done: snapshot.done,
            last_at: now,
            last_done: snapshot.done,
        }
    }
}

fn rate(items: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { items as f64 / secs } else { 0.0 }
}

pub struct SyncReport {
    feeds: Vec<Arc<FeedProgress>>,
    pool: SyncPeerPool,
    mode: watch::Receiver<SyncMode>,
    baselines: HashMap<DataKind, Baseline>,
    sinks: Vec<Box<dyn ReportSink>>,
}

impl SyncReport {
    pub fn new(pool: SyncPeerPool, mode: watch::Receiver<SyncMode>) -> Self {
        Self {
            feeds: Vec::new(),
            pool,
            mode,
            baselines: HashMap::new(),
            sinks: Vec::new(),
        }
    }

    pub fn track(mut self, progress: Arc<FeedProgress>) -> Self {
        self.feeds.push(progress);
        self
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Sample every initialized feed. Feeds whose range was never reset
    /// are skipped.
    pub fn sample(&mut self) -> Vec<FeedSample> {
        let now = Instant::now();
        let mut samples = Vec::new();

        for progress in &self.feeds {
            let snapshot = progress.snapshot();
            let Some(total) = snapshot.total else {
                continue;
            };

            let baseline = self
                .baselines
                .entry(snapshot.kind)
                .and_modify(|baseline| {
                    if baseline.generation != snapshot.generation {
                        *baseline = Baseline::new(&snapshot, now);
                    }
                })
                .or_insert_with(|| Baseline::new(&snapshot, now));

            let current_rate = rate(
                snapshot.done.saturating_sub(baseline.last_done),
                now - baseline.last_at,
            );
            let total_rate = rate(
                snapshot.done.saturating_sub(baseline.first_done),
                now - baseline.first_at,
            );
            baseline.last_at = now;
            baseline.last_done = snapshot.done;

            samples.push(FeedSample {
                kind: snapshot.kind,
                done: snapshot.done,
                total,
                queued: snapshot.queued,
                percent: snapshot.percent().unwrap_or(0.0),
                current_rate,
                total_rate,
            });
        }

        samples
    }

    /// Lines for one tick: a summary line, then one line per sampled feed.
    pub fn render(&mut self) -> Vec<String> {
        let stats = self.pool.stats();
        let mode = *self.mode.borrow();
        let samples = self.sample();

        let mut lines = Vec::with_capacity(samples.len() + 1);
        lines.push(format!(
            "Sync {mode} | peers {}/{} | banned {}",
            stats.initialized, stats.connected, stats.banned
        ));
        lines.extend(samples.iter().map(FeedSample::render));

        for sink in &self.sinks {
            for sample in &samples {
                if let Err(error) = sink.record_feed(sample) {
                    debug!(%error, "Report sink rejected feed sample");
                }
            }
            if let Err(error) = sink.record_pool(&stats, mode) {
                debug!(%error, "Report sink rejected pool stats");
            }
        }

        lines
    }

    pub fn emit(&mut self) {
        let lines = self.render();
        for sink in &self.sinks {
            for line in &lines {
                if let Err(error) = sink.emit_line(line) {
                    debug!(%error, "Report sink rejected line");
                }
            }
        }
    }

    pub fn spawn(mut self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.emit();
            }
        })
    }
}
