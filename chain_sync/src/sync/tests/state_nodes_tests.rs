use std::time::Duration;

use containers::BlockNumber;
use pretty_assertions::assert_eq;

use super::support::{as_store, as_transport, chain, feed_config, genesis_store, network};
use crate::{
    sim::{PeerBehaviour, SimulatedChain},
    sync::{
        config::INITIAL_PEER_SCORE,
        feed::Feed,
        state_nodes::{StateNodesKind, StateTarget, walk_state},
        FeedState, SyncPeerPool,
    },
    types::{ChainStore, DataKind},
};

const RUN_LIMIT: Duration = Duration::from_secs(120);

fn target(chain: &SimulatedChain, pivot: BlockNumber) -> StateTarget {
    StateTarget {
        pivot,
        root: chain.header(pivot).unwrap().state_root,
    }
}

fn requested_nodes(network: &crate::sim::SimulatedNetwork) -> usize {
    network
        .requests()
        .iter()
        .filter(|request| request.kind == DataKind::StateNodes)
        .map(|request| request.count)
        .sum()
}

#[test]
fn test_walk_empty_store() {
    let chain = chain(10);
    let store = genesis_store(&chain);
    let root = chain.header(5).unwrap().state_root;

    let (stored, missing) = walk_state(store.as_ref(), root);
    assert_eq!(stored, 0);
    assert_eq!(missing, vec![root]);
}

#[tokio::test(start_paused = true)]
async fn test_state_download_completes_tree() {
    let chain = chain(130);
    let network = network(&chain);
    let store = genesis_store(&chain);
    let pool = SyncPeerPool::new();
    let peer = network.add_peer(PeerBehaviour::Honest, 129);
    pool.add_peer(peer);
    pool.update_head(&peer, chain.head_at(129).unwrap());

    let mut feed = Feed::new(
        StateNodesKind::new(as_store(&store), 8),
        pool.clone(),
        as_transport(&network),
        feed_config(),
    );
    feed.activate(target(&chain, 100));
    tokio::time::timeout(RUN_LIMIT, feed.run_until_finished())
        .await
        .unwrap();

    let size = chain.state_size(100).unwrap();
    assert_eq!(feed.state(), FeedState::Finished);
    assert_eq!(store.state_node_count() as u64, size);
    let (stored, missing) = walk_state(store.as_ref(), target(&chain, 100).root);
    assert_eq!((stored, missing.len()), (size, 0));
    assert_eq!(requested_nodes(&network) as u64, size);

    let progress = feed.progress().snapshot();
    assert_eq!(progress.done, size);
    assert_eq!(progress.total, Some(size));
}

#[tokio::test(start_paused = true)]
async fn test_partial_responses_are_not_penalized() {
    let chain = chain(130);
    let network = network(&chain);
    let store = genesis_store(&chain);
    let pool = SyncPeerPool::new();
    let peer = network.add_peer(PeerBehaviour::StateNodeLimit(2), 129);
    pool.add_peer(peer);
    pool.update_head(&peer, chain.head_at(129).unwrap());

    let mut feed = Feed::new(
        StateNodesKind::new(as_store(&store), 8),
        pool.clone(),
        as_transport(&network),
        feed_config(),
    );
    feed.activate(target(&chain, 100));
    tokio::time::timeout(RUN_LIMIT, feed.run_until_finished())
        .await
        .unwrap();

    assert_eq!(
        store.state_node_count() as u64,
        chain.state_size(100).unwrap()
    );
    assert_eq!(pool.get_peer(&peer).unwrap().score, INITIAL_PEER_SCORE);
}

#[tokio::test(start_paused = true)]
async fn test_newer_root_reuses_stored_nodes() {
    let chain = chain(130);
    let network = network(&chain);
    let store = genesis_store(&chain);
    let pool = SyncPeerPool::new();
    let peer = network.add_peer(PeerBehaviour::Honest, 129);
    pool.add_peer(peer);
    pool.update_head(&peer, chain.head_at(129).unwrap());

    let mut feed = Feed::new(
        StateNodesKind::new(as_store(&store), 8),
        pool.clone(),
        as_transport(&network),
        feed_config(),
    );
    feed.activate(target(&chain, 100));
    tokio::time::timeout(RUN_LIMIT, feed.run_until_finished())
        .await
        .unwrap();
    let first = requested_nodes(&network);

    // Blocks 100 and 101 share everything below the root.
    feed.activate(target(&chain, 101));
    let progress = feed.progress().snapshot();
    assert_eq!((progress.done, progress.total), (0, Some(1)));
    tokio::time::timeout(RUN_LIMIT, feed.run_until_finished())
        .await
        .unwrap();

    assert_eq!(requested_nodes(&network), first + 1);
    let (_, missing) = walk_state(store.as_ref(), target(&chain, 101).root);
    assert!(missing.is_empty());
}
