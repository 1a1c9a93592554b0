pub mod server;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prometheus registry for chain sync telemetry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    // Peers
    peers_connected: IntGauge,
    peers_initialized: IntGauge,
    peers_banned: IntGauge,
    // Feeds
    feed_done: IntGaugeVec,
    feed_total: IntGaugeVec,
    feed_queued: IntGaugeVec,
    feed_rate: GaugeVec,
    // Mode
    sync_mode: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let peers_connected = IntGauge::with_opts(Opts::new(
            "sync_peers_connected",
            "Number of peers known to the sync pool",
        ))?;
        registry.register(Box::new(peers_connected.clone()))?;

        let peers_initialized = IntGauge::with_opts(Opts::new(
            "sync_peers_initialized",
            "Number of peers that reported a head and are not banned",
        ))?;
        registry.register(Box::new(peers_initialized.clone()))?;

        let peers_banned = IntGauge::with_opts(Opts::new(
            "sync_peers_banned",
            "Number of connected peers banned for bad data",
        ))?;
        registry.register(Box::new(peers_banned.clone()))?;

        let feed_done = IntGaugeVec::new(
            Opts::new("sync_feed_done", "Items persisted in the active range"),
            &["kind"],
        )?;
        registry.register(Box::new(feed_done.clone()))?;

        let feed_total = IntGaugeVec::new(
            Opts::new("sync_feed_total", "Items in the active range"),
            &["kind"],
        )?;
        registry.register(Box::new(feed_total.clone()))?;

        let feed_queued = IntGaugeVec::new(
            Opts::new("sync_feed_queued", "Items in flight or waiting to be persisted"),
            &["kind"],
        )?;
        registry.register(Box::new(feed_queued.clone()))?;

        let feed_rate = GaugeVec::new(
            Opts::new("sync_feed_rate", "Items persisted per second over the last interval"),
            &["kind"],
        )?;
        registry.register(Box::new(feed_rate.clone()))?;

        let sync_mode = IntGauge::with_opts(Opts::new(
            "sync_mode",
            "Bit set of active sync phases",
        ))?;
        registry.register(Box::new(sync_mode.clone()))?;

        Ok(Self {
            registry,
            peers_connected,
            peers_initialized,
            peers_banned,
            feed_done,
            feed_total,
            feed_queued,
            feed_rate,
            sync_mode,
        })
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    // Peers
    pub fn set_peers(&self, connected: i64, initialized: i64, banned: i64) {
        self.peers_connected.set(connected);
        self.peers_initialized.set(initialized);
        self.peers_banned.set(banned);
    }

    // Feeds
    pub fn set_feed_progress(&self, kind: &str, done: i64, total: i64, queued: i64) {
        self.feed_done.with_label_values(&[kind]).set(done);
        self.feed_total.with_label_values(&[kind]).set(total);
        self.feed_queued.with_label_values(&[kind]).set(queued);
    }

    pub fn set_feed_rate(&self, kind: &str, rate: f64) {
        self.feed_rate.with_label_values(&[kind]).set(rate);
    }

    // Mode
    pub fn set_sync_mode(&self, bits: i64) {
        self.sync_mode.set(bits);
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_feed_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.set_feed_progress("bodies", 10, 70, 4);
        metrics.set_feed_rate("bodies", 2.5);
        metrics.set_sync_mode(0b1_0000);

        let text = metrics.gather().unwrap();
        assert!(text.contains("sync_feed_done{kind=\"bodies\"} 10"));
        assert!(text.contains("sync_feed_total{kind=\"bodies\"} 70"));
        assert!(text.contains("sync_mode 16"));
    }
}
