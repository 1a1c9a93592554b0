use std::{sync::Arc, time::Duration};

use containers::BlockNumber;
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use super::support::{as_store, as_transport, chain, genesis_store, network, test_config, validator};
use crate::{
    sim::{PeerBehaviour, SimulatedChain, SimulatedNetwork},
    sync::{
        feed::BlockRange, store::MemoryStore, PeerOutcome, SyncConfig, SyncError, SyncMode,
        SyncService,
    },
    types::{ChainStore, DataKind, SyncEvent},
};

const PIVOT: BlockNumber = 100;
const HEAD: BlockNumber = 129;
const RUN_LIMIT: Duration = Duration::from_secs(600);

struct Harness {
    chain: Arc<SimulatedChain>,
    network: Arc<SimulatedNetwork>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let chain = chain(HEAD + 1);
        Self {
            network: network(&chain),
            store: genesis_store(&chain),
            chain,
        }
    }

    fn service(&self, config: SyncConfig) -> SyncService {
        SyncService::new(
            config,
            as_store(&self.store),
            validator(),
            as_transport(&self.network),
        )
        .unwrap()
    }
}

async fn modes_until(modes: &mut broadcast::Receiver<SyncMode>, last: SyncMode) -> Vec<SyncMode> {
    let mut seen = Vec::new();
    loop {
        let mode = modes.recv().await.unwrap();
        seen.push(mode);
        if mode == last {
            return seen;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_fast_sync_then_follow_head() {
    let harness = Harness::new();
    harness.network.add_peer(PeerBehaviour::Honest, HEAD);
    let service = harness.service(test_config(PIVOT));
    let mut modes = service.subscribe_mode_changes();
    let events = service.events();
    let task = tokio::spawn(service.run());

    for event in harness.network.connect_all() {
        events.send(event).unwrap();
    }
    let seen = tokio::time::timeout(RUN_LIMIT, modes_until(&mut modes, SyncMode::WAITING_FOR_BLOCK))
        .await
        .unwrap();

    assert_eq!(
        seen,
        vec![
            SyncMode::DISCONNECTED,
            SyncMode::FAST_SYNC,
            SyncMode::FAST_BLOCKS,
            SyncMode::STATE_NODES,
            SyncMode::FULL,
            SyncMode::WAITING_FOR_BLOCK,
        ]
    );

    let store = &harness.store;
    assert_eq!(store.stored_range(DataKind::Headers), Some(BlockRange::new(0, PIVOT)));
    assert_eq!(store.stored_range(DataKind::Bodies), Some(BlockRange::new(0, PIVOT)));
    assert_eq!(store.stored_range(DataKind::Receipts), Some(BlockRange::new(0, PIVOT)));
    assert_eq!(
        store.stored_range(DataKind::Blocks),
        Some(BlockRange::new(PIVOT + 1, HEAD + 1))
    );
    assert_eq!(
        store.state_node_count() as u64,
        harness.chain.state_size(PIVOT).unwrap()
    );
    assert_eq!(store.best_full_block().as_ref(), harness.chain.header(HEAD));

    events.send(SyncEvent::Shutdown).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_barriers_limit_ancient_ranges() {
    let harness = Harness::new();
    harness.network.add_peer(PeerBehaviour::Honest, HEAD);
    let config = SyncConfig {
        ancient_bodies_barrier: Some(30),
        ancient_receipts_barrier: Some(60),
        ..test_config(PIVOT)
    };
    let service = harness.service(config);
    let bodies = service.progress(DataKind::Bodies);
    let receipts = service.progress(DataKind::Receipts);
    let mut modes = service.subscribe_mode_changes();
    let events = service.events();

    assert!(!bodies.is_initialized());
    let task = tokio::spawn(service.run());
    for event in harness.network.connect_all() {
        events.send(event).unwrap();
    }
    tokio::time::timeout(RUN_LIMIT, modes_until(&mut modes, SyncMode::STATE_NODES))
        .await
        .unwrap();

    let snapshot = bodies.snapshot();
    assert_eq!((snapshot.start, snapshot.total), (30, Some(PIVOT - 30)));
    assert_eq!(snapshot.done, PIVOT - 30);
    assert_eq!(receipts.snapshot().total, Some(PIVOT - 60));

    let store = &harness.store;
    assert_eq!(store.stored_range(DataKind::Bodies), Some(BlockRange::new(30, PIVOT)));
    assert_eq!(store.stored_range(DataKind::Receipts), Some(BlockRange::new(60, PIVOT)));
    assert_eq!(store.body(29), None);

    events.send(SyncEvent::Shutdown).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_historical_phases_run_together() {
    let harness = Harness::new();
    let peer = harness.network.add_peer(PeerBehaviour::Silent, HEAD);
    let mut service = harness.service(test_config(PIVOT));

    service.handle_event(SyncEvent::PeerConnected(peer));
    assert_eq!(service.mode(), SyncMode::DISCONNECTED);
    assert!(service.running_feeds().is_empty());

    service.handle_event(harness.network.handshake(&peer).unwrap());
    assert_eq!(service.mode(), SyncMode::FAST_SYNC);

    let pivot = harness.chain.header(PIVOT).cloned().unwrap();
    service.handle_event(SyncEvent::PivotResolved(pivot));
    assert_eq!(service.mode(), SyncMode::FAST_BLOCKS);
    assert_eq!(
        service.running_feeds(),
        vec![DataKind::Headers, DataKind::Bodies, DataKind::Receipts]
    );
    assert_eq!(*service.subscribe_mode().borrow(), SyncMode::FAST_BLOCKS);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_every_feed() {
    let harness = Harness::new();
    let peer = harness.network.add_peer(PeerBehaviour::Silent, HEAD);
    let mut service = harness.service(test_config(PIVOT));

    service.handle_event(harness.network.handshake(&peer).unwrap());
    let pivot = harness.chain.header(PIVOT).cloned().unwrap();
    service.handle_event(SyncEvent::PivotResolved(pivot));
    assert!(!service.running_feeds().is_empty());

    service.handle_event(SyncEvent::PeerDisconnected(peer));
    assert_eq!(service.mode(), SyncMode::DISCONNECTED);
    assert!(service.running_feeds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_banned_peer_is_disconnected() {
    let harness = Harness::new();
    let bad = harness.network.add_peer(PeerBehaviour::Silent, HEAD);
    let good = harness.network.add_peer(PeerBehaviour::Silent, HEAD);
    let mut service = harness.service(test_config(PIVOT));
    service.handle_event(harness.network.handshake(&bad).unwrap());

    for _ in 0..3 {
        service.pool().report(&bad, PeerOutcome::ProtocolViolation);
    }
    service.handle_event(harness.network.handshake(&good).unwrap());

    assert_eq!(harness.network.disconnected(), vec![bad]);
    assert_eq!(service.pool().initialized_peers_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caught_up_node_waits_for_blocks() {
    let harness = Harness::new();
    let peer = harness.network.add_peer(PeerBehaviour::Honest, 0);
    let mut service = harness.service(test_config(PIVOT));

    service.handle_event(harness.network.handshake(&peer).unwrap());
    assert_eq!(service.mode(), SyncMode::WAITING_FOR_BLOCK);
    assert!(service.running_feeds().is_empty());

    // A new block within the fast sync lag is fetched in full.
    let event = harness.network.set_head(&peer, 10).unwrap();
    service.handle_event(event);
    assert_eq!(service.mode(), SyncMode::FULL);
    assert_eq!(service.running_feeds(), vec![DataKind::Blocks]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_event_stops_loop() {
    let harness = Harness::new();
    let mut service = harness.service(test_config(PIVOT));
    assert!(service.handle_event(SyncEvent::PeerConnected(PeerId::random())));
    assert!(!service.handle_event(SyncEvent::Shutdown));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let harness = Harness::new();
    let config = SyncConfig {
        ancient_bodies_barrier: Some(PIVOT + 1),
        ..test_config(PIVOT)
    };
    let result = SyncService::new(
        config,
        as_store(&harness.store),
        validator(),
        as_transport(&harness.network),
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}
