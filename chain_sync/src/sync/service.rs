/// Sync service coordinating all synchronization operations.
///
/// The SyncService is the main entry point for synchronization. It owns:
/// - SyncPeerPool: Tracking peers, heads and reputation
/// - Feeds: One spawned feed per data class
/// - PivotTracker: The fast-sync trust anchor
/// - Mode selection: Re-evaluated on every event, applied to the feeds
use std::{sync::Arc, time::Duration};

use containers::{BlockNumber, ChainHead};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    bodies::BodiesKind,
    config::{PIVOT_CHECK_INTERVAL, SyncConfig},
    error::SyncError,
    feed::{BlockRange, Feed, FeedHandle},
    head_sync::FullBlocksKind,
    headers::{HeaderTarget, HeadersKind, headers_complete},
    mode::SyncMode,
    peer_pool::SyncPeerPool,
    pivot::{PivotTracker, resolve_pivot_header},
    progress::FeedProgress,
    receipts::ReceiptsKind,
    report::{LogSink, ReportSink, SyncReport},
    selector::{LocalChainState, PeerState, select_mode},
    state_nodes::{StateNodesKind, StateTarget, walk_state},
};
use crate::types::{BlockValidator, ChainStore, DataKind, SyncEvent, SyncTransport};

const MODE_HISTORY: usize = 64;

/// Sync service coordinating all sync operations.
pub struct SyncService {
    config: SyncConfig,
    pool: SyncPeerPool,
    store: Arc<dyn ChainStore>,
    transport: Arc<dyn SyncTransport>,
    pivot: PivotTracker,
    mode: SyncMode,
    mode_tx: watch::Sender<SyncMode>,
    mode_changes: broadcast::Sender<SyncMode>,
    headers: FeedHandle<HeaderTarget>,
    bodies: FeedHandle<BlockRange>,
    receipts: FeedHandle<BlockRange>,
    state: FeedHandle<StateTarget>,
    full: FeedHandle<BlockRange>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    events_rx: mpsc::UnboundedReceiver<SyncEvent>,
    pivot_resolution: Option<JoinHandle<()>>,
    /// Pivot number whose state is known to be complete.
    state_synced_at: Option<BlockNumber>,
    report: Option<SyncReport>,
}

impl SyncService {
    /// Validate the configuration and spawn the feeds. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ChainStore>,
        validator: Arc<dyn BlockValidator>,
        transport: Arc<dyn SyncTransport>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let pool = SyncPeerPool::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(SyncMode::NONE);
        let (mode_changes, _) = broadcast::channel(MODE_HISTORY);
        let feed_config = config.feed_config();

        let headers = Feed::new(
            HeadersKind::new(
                store.clone(),
                validator.clone(),
                config.batch_size(DataKind::Headers),
            ),
            pool.clone(),
            transport.clone(),
            feed_config,
        )
        .spawn(events_tx.clone());
        let bodies = Feed::new(
            BodiesKind::new(
                store.clone(),
                validator.clone(),
                config.batch_size(DataKind::Bodies),
            ),
            pool.clone(),
            transport.clone(),
            feed_config,
        )
        .spawn(events_tx.clone());
        let receipts = Feed::new(
            ReceiptsKind::new(
                store.clone(),
                validator.clone(),
                config.batch_size(DataKind::Receipts),
            ),
            pool.clone(),
            transport.clone(),
            feed_config,
        )
        .spawn(events_tx.clone());
        let state = Feed::new(
            StateNodesKind::new(store.clone(), config.batch_size(DataKind::StateNodes)),
            pool.clone(),
            transport.clone(),
            feed_config,
        )
        .spawn(events_tx.clone());
        let full = Feed::new(
            FullBlocksKind::new(
                store.clone(),
                validator,
                config.batch_size(DataKind::Blocks),
            ),
            pool.clone(),
            transport.clone(),
            feed_config,
        )
        .spawn(events_tx.clone());

        let report = SyncReport::new(pool.clone(), mode_rx)
            .track(headers.progress())
            .track(bodies.progress())
            .track(receipts.progress())
            .track(state.progress())
            .track(full.progress())
            .with_sink(LogSink);

        info!(
            fast_sync = config.fast_sync,
            pivot = %config.pivot_number,
            bodies_barrier = ?config.ancient_bodies_barrier,
            receipts_barrier = ?config.ancient_receipts_barrier,
            "Sync service created"
        );

        Ok(Self {
            pivot: PivotTracker::new(&config),
            config,
            pool,
            store,
            transport,
            mode: SyncMode::NONE,
            mode_tx,
            mode_changes,
            headers,
            bodies,
            receipts,
            state,
            full,
            events_tx,
            events_rx,
            pivot_resolution: None,
            state_synced_at: None,
            report: Some(report),
        })
    }

    /// Add a destination for the periodic report besides the log.
    pub fn with_report_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.report = self.report.take().map(|report| report.with_sink(sink));
        self
    }

    /// Sender for transport and internal events.
    pub fn events(&self) -> mpsc::UnboundedSender<SyncEvent> {
        self.events_tx.clone()
    }

    pub fn pool(&self) -> SyncPeerPool {
        self.pool.clone()
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<SyncMode> {
        self.mode_tx.subscribe()
    }

    /// Every mode transition, in order.
    pub fn subscribe_mode_changes(&self) -> broadcast::Receiver<SyncMode> {
        self.mode_changes.subscribe()
    }

    pub fn progress(&self, kind: DataKind) -> Arc<FeedProgress> {
        match kind {
            DataKind::Headers => self.headers.progress(),
            DataKind::Bodies => self.bodies.progress(),
            DataKind::Receipts => self.receipts.progress(),
            DataKind::StateNodes => self.state.progress(),
            DataKind::Blocks => self.full.progress(),
        }
    }

    /// Which feeds are currently told to run.
    pub fn running_feeds(&self) -> Vec<DataKind> {
        DataKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                DataKind::Headers => self.headers.is_running(),
                DataKind::Bodies => self.bodies.is_running(),
                DataKind::Receipts => self.receipts.is_running(),
                DataKind::StateNodes => self.state.is_running(),
                DataKind::Blocks => self.full.is_running(),
            })
            .collect()
    }

    /// Process events until shutdown.
    pub async fn run(mut self) {
        let report = self
            .report
            .take()
            .map(|report| report.spawn(self.config.report_interval()));
        let mut pivot_check = tokio::time::interval(PIVOT_CHECK_INTERVAL);
        pivot_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.update_mode();

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !self.handle_event(event) {
                        break;
                    }
                }
                _ = pivot_check.tick() => self.check_pivot(),
            }
        }

        info!("Sync service shutting down");
        self.shutdown();
        if let Some(report) = report {
            report.abort();
        }
    }

    /// Apply one event and re-evaluate the mode. Returns false on shutdown.
    pub fn handle_event(&mut self, event: SyncEvent) -> bool {
        debug!(%event, "Sync event");

        match event {
            SyncEvent::PeerConnected(peer) => {
                self.pool.add_peer(peer);
            }
            SyncEvent::PeerHead(peer, head) => {
                self.pool.add_peer(peer);
                self.pool.update_head(&peer, head);
            }
            SyncEvent::PeerDisconnected(peer) => {
                self.pool.remove_peer(&peer);
            }
            SyncEvent::FeedFinished(kind) => {
                debug!(%kind, "Feed finished its range");
                if kind == DataKind::StateNodes {
                    self.on_state_finished();
                }
            }
            SyncEvent::PivotResolved(header) => {
                self.pivot_resolution = None;
                self.pivot.accept(header);
            }
            SyncEvent::PivotFailed(reason) => {
                debug!(%reason, "Pivot resolution attempt failed");
            }
            SyncEvent::Shutdown => return false,
        }

        for peer in self.pool.take_disconnect_requests() {
            self.transport.disconnect(peer);
        }
        self.update_mode();
        true
    }

    fn local_state(&self) -> LocalChainState {
        let best_full_block = self
            .store
            .best_full_block()
            .map_or(0, |header| header.number);
        let Some(pivot) = self.pivot.current() else {
            return LocalChainState {
                best_full_block,
                ..Default::default()
            };
        };

        let headers = HeaderTarget::to_pivot(&pivot.header).range;
        let mut historical = Vec::new();
        if self.config.download_bodies_in_fast_sync {
            if let Some(range) = self.pivot.ancient_range(self.config.ancient_bodies_barrier) {
                historical.push((DataKind::Bodies, range));
            }
        }
        if self.config.download_receipts_in_fast_sync {
            if let Some(range) = self.pivot.ancient_range(self.config.ancient_receipts_barrier) {
                historical.push((DataKind::Receipts, range));
            }
        }
        let historical_complete = headers_complete(self.store.as_ref(), headers)
            && historical
                .into_iter()
                .all(|(kind, range)| self.phase_complete(kind, range));

        LocalChainState {
            best_full_block,
            pivot: Some(pivot.number()),
            historical_complete,
            state_complete: self.state_synced_at == Some(pivot.number())
                || pivot.number() <= best_full_block,
        }
    }

    fn phase_complete(&self, kind: DataKind, range: BlockRange) -> bool {
        range.is_empty()
            || self
                .store
                .next_missing(kind)
                .is_some_and(|next| next >= range.end)
    }

    fn peer_state(&self) -> PeerState {
        PeerState {
            initialized_peers: self.pool.initialized_peers_count(),
            best_head: self.pool.best_peer_head(),
        }
    }

    fn update_mode(&mut self) {
        let mode = select_mode(&self.config, &self.local_state(), &self.peer_state());
        if mode != self.mode {
            info!(from = %self.mode, to = %mode, "Sync mode changed");
            self.mode = mode;
            self.mode_tx.send_replace(mode);
            // No subscribers is fine.
            let _ = self.mode_changes.send(mode);
        }
        self.apply_mode();
    }

    /// Point every feed at its target for the current mode, or stop it.
    fn apply_mode(&mut self) {
        let mode = self.mode;
        let pivot = self.pivot.current().cloned();

        match &pivot {
            Some(pivot) if mode.contains(SyncMode::FAST_HEADERS) => {
                self.headers.activate(HeaderTarget::to_pivot(&pivot.header));
            }
            _ => {
                self.headers.deactivate();
            }
        }

        let bodies = self
            .pivot
            .ancient_range(self.config.ancient_bodies_barrier)
            .filter(|_| mode.contains(SyncMode::FAST_BODIES))
            .filter(|_| self.config.download_bodies_in_fast_sync);
        match bodies {
            Some(range) => self.bodies.activate(range),
            None => self.bodies.deactivate(),
        };

        let receipts = self
            .pivot
            .ancient_range(self.config.ancient_receipts_barrier)
            .filter(|_| mode.contains(SyncMode::FAST_RECEIPTS))
            .filter(|_| self.config.download_receipts_in_fast_sync);
        match receipts {
            Some(range) => self.receipts.activate(range),
            None => self.receipts.deactivate(),
        };

        match &pivot {
            Some(pivot) if mode.contains(SyncMode::STATE_NODES) => {
                self.state.activate(StateTarget {
                    pivot: pivot.number(),
                    root: pivot.state_root(),
                });
            }
            _ => {
                self.state.deactivate();
            }
        }

        match self.full_target().filter(|_| mode.contains(SyncMode::FULL)) {
            Some(range) => self.full.activate(range),
            None => self.full.deactivate(),
        };

        if mode.contains(SyncMode::FAST_SYNC) {
            self.start_pivot_resolution();
        }
    }

    /// `[best full + 1, best head + 1)`, keeping the start of a running
    /// target so head updates only extend it.
    fn full_target(&self) -> Option<BlockRange> {
        let head = self.pool.best_peer_head()?;
        let next = self
            .store
            .best_full_block()
            .map_or(0, |header| header.number + 1);
        let start = self
            .full
            .target()
            .map_or(next, |running| running.start.min(next));
        Some(BlockRange::new(start, head.number + 1))
    }

    fn on_state_finished(&mut self) {
        let Some(pivot) = self.pivot.current().cloned() else {
            return;
        };
        let (stored, missing) = walk_state(self.store.as_ref(), pivot.state_root());
        if !missing.is_empty() {
            debug!(missing = missing.len(), "State feed finished an outdated target");
            return;
        }

        info!(
            checkpoint = ?pivot.checkpoint(),
            nodes = stored,
            "State sync complete"
        );
        self.state_synced_at = Some(pivot.number());
        self.store.set_best_full_block(pivot.header);
    }

    fn start_pivot_resolution(&mut self) {
        if self
            .pivot_resolution
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let Some(ChainHead { number: best, .. }) = self.pool.best_peer_head() else {
            return;
        };

        let number = self.pivot.target_number(best);
        let expected_hash = self.pivot.expected_hash(number);
        let pool = self.pool.clone();
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let timeout = self.config.request_timeout();
        let backoff = self.config.backoff();

        info!(number, best_head = best, "Resolving pivot");
        self.pivot_resolution = Some(tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match resolve_pivot_header(&pool, &transport, number, expected_hash, timeout).await
                {
                    Ok(header) => {
                        let _ = events.send(SyncEvent::PivotResolved(header));
                        return;
                    }
                    Err(error) => {
                        if events
                            .send(SyncEvent::PivotFailed(error.to_string()))
                            .is_err()
                        {
                            return;
                        }
                        tokio::time::sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }));
    }

    fn check_pivot(&mut self) {
        if !self.mode.contains(SyncMode::STATE_NODES) {
            return;
        }
        self.pivot
            .note_state_progress(self.state.progress().snapshot().done);

        let Some(head) = self.pool.best_peer_head() else {
            return;
        };
        if self.pivot.should_advance(head.number) {
            warn!(
                pivot = ?self.pivot.current().map(|pivot| pivot.number()),
                best_head = head.number,
                "State sync stalled, advancing pivot"
            );
            self.start_pivot_resolution();
        }
    }

    fn shutdown(&mut self) {
        self.headers.deactivate();
        self.bodies.deactivate();
        self.receipts.deactivate();
        self.state.deactivate();
        self.full.deactivate();
        if let Some(task) = self.pivot_resolution.take() {
            task.abort();
        }
    }
}

/// Wait until `mode` satisfies `predicate`, for at most `timeout`.
pub async fn wait_for_mode(
    mode: &mut watch::Receiver<SyncMode>,
    timeout: Duration,
    predicate: impl Fn(SyncMode) -> bool,
) -> Option<SyncMode> {
    let wait = mode.wait_for(|current| predicate(*current));
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(current)) => Some(*current),
        _ => None,
    }
}
