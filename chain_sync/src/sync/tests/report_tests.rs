use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

use crate::{
    sync::{FeedProgress, FeedSample, ReportSink, SyncMode, SyncPeerPool, SyncReport},
    types::DataKind,
};

#[derive(Default)]
struct Collect {
    lines: Mutex<Vec<String>>,
    samples: Mutex<Vec<FeedSample>>,
}

impl ReportSink for Collect {
    fn emit_line(&self, line: &str) -> Result<()> {
        self.lines.lock().push(line.to_owned());
        Ok(())
    }

    fn record_feed(&self, sample: &FeedSample) -> Result<()> {
        self.samples.lock().push(*sample);
        Ok(())
    }
}

struct Broken;

impl ReportSink for Broken {
    fn emit_line(&self, _line: &str) -> Result<()> {
        bail!("sink closed")
    }
}

fn report(mode: SyncMode, feeds: &[&Arc<FeedProgress>]) -> (SyncReport, watch::Sender<SyncMode>) {
    let (mode_tx, mode_rx) = watch::channel(mode);
    let report = feeds
        .iter()
        .fold(SyncReport::new(SyncPeerPool::new(), mode_rx), |report, feed| {
            report.track(Arc::clone(feed))
        });
    (report, mode_tx)
}

#[tokio::test(start_paused = true)]
async fn test_uninitialized_feed_is_not_reported() {
    let bodies = Arc::new(FeedProgress::new(DataKind::Bodies));
    let (mut report, _mode) = report(SyncMode::FAST_BLOCKS, &[&bodies]);

    let lines = report.render();
    assert_eq!(
        lines,
        vec!["Sync FastHeaders|FastBodies|FastReceipts | peers 0/0 | banned 0".to_owned()]
    );

    bodies.reset(30, 100);
    bodies.add_done(35);
    let lines = report.render();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("Old Bodies   35 / 70 (50.00%)"), "{}", lines[1]);
}

#[tokio::test(start_paused = true)]
async fn test_rates_follow_persisted_items() {
    let headers = Arc::new(FeedProgress::new(DataKind::Headers));
    headers.reset(0, 1000);
    let (mut report, _mode) = report(SyncMode::FAST_BLOCKS, &[&headers]);
    report.sample();

    tokio::time::advance(Duration::from_secs(10)).await;
    headers.add_done(100);
    let sample = report.sample()[0];
    assert_eq!(sample.current_rate, 10.0);
    assert_eq!(sample.total_rate, 10.0);

    tokio::time::advance(Duration::from_secs(10)).await;
    headers.add_done(300);
    let sample = report.sample()[0];
    assert_eq!(sample.current_rate, 30.0);
    assert_eq!(sample.total_rate, 20.0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_restarts_rate_baseline() {
    let full = Arc::new(FeedProgress::new(DataKind::Blocks));
    full.reset(0, 100);
    let (mut report, _mode) = report(SyncMode::FULL, &[&full]);
    report.sample();

    tokio::time::advance(Duration::from_secs(5)).await;
    full.add_done(100);
    report.sample();

    full.reset(100, 200);
    tokio::time::advance(Duration::from_secs(5)).await;
    let sample = report.sample()[0];
    assert_eq!(sample.done, 0);
    assert_eq!(sample.current_rate, 0.0);
    assert_eq!(sample.total_rate, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_mode_change_shows_in_summary() {
    let (mut report, mode) = report(SyncMode::FAST_SYNC, &[]);
    assert!(report.render()[0].starts_with("Sync FastSync |"));

    mode.send_replace(SyncMode::STATE_NODES);
    assert!(report.render()[0].starts_with("Sync StateNodes |"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_sink_does_not_block_others() {
    let receipts = Arc::new(FeedProgress::new(DataKind::Receipts));
    receipts.reset(0, 10);
    let collect = Arc::new(Collect::default());
    let (report, _mode) = report(SyncMode::FAST_BLOCKS, &[&receipts]);
    let mut report = report.with_sink(Broken).with_sink(collect.clone());

    report.emit();

    assert_eq!(collect.lines.lock().len(), 2);
    assert_eq!(collect.samples.lock()[0].kind, DataKind::Receipts);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_sink_exports_gauges() {
    let state = Arc::new(FeedProgress::new(DataKind::StateNodes));
    state.reset(0, 40);
    state.add_done(10);
    let metrics = Arc::new(metrics::Metrics::new().unwrap());
    let (report, _mode) = report(SyncMode::STATE_NODES, &[&state]);
    let mut report = report.with_sink(metrics.clone());

    report.emit();

    let text = metrics.gather().unwrap();
    assert!(text.contains("sync_feed_done{kind=\"state_nodes\"} 10"), "{text}");
    assert!(text.contains("sync_feed_total{kind=\"state_nodes\"} 40"), "{text}");
    assert!(text.contains(&format!("sync_mode {}", SyncMode::STATE_NODES.bits())));
}
