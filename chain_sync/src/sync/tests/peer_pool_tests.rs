use std::{collections::HashSet, time::Duration};

use containers::{BlockNumber, Bytes32, ChainHead};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;

use crate::sync::{
    config::{INITIAL_PEER_SCORE, PEER_TIMEOUT_SLEEP, SCORE_INVALID_DATA},
    AllocationRequest, AllocationStrategy, PeerOutcome, SyncPeerPool,
};

fn head(number: BlockNumber) -> ChainHead {
    ChainHead::new(number, Bytes32::ZERO, u128::from(number))
}

fn pool_with(heads: &[BlockNumber]) -> (SyncPeerPool, Vec<PeerId>) {
    let pool = SyncPeerPool::new();
    let peers = heads
        .iter()
        .map(|number| {
            let peer = PeerId::random();
            pool.add_peer(peer);
            pool.update_head(&peer, head(*number));
            peer
        })
        .collect();
    (pool, peers)
}

fn best_head() -> AllocationRequest {
    AllocationRequest::new(AllocationStrategy::BestHead)
}

#[test]
fn test_add_peer_rejects_duplicates() {
    let pool = SyncPeerPool::new();
    let peer = PeerId::random();

    assert!(pool.add_peer(peer));
    assert!(!pool.add_peer(peer));
    assert_eq!(pool.stats().connected, 1);
}

#[test]
fn test_peer_without_head_is_not_allocatable() {
    let pool = SyncPeerPool::new();
    let peer = PeerId::random();
    pool.add_peer(peer);

    assert_eq!(pool.initialized_peers_count(), 0);
    assert!(pool.allocate(&best_head()).is_err());

    pool.update_head(&peer, head(10));
    assert_eq!(pool.initialized_peers_count(), 1);
    assert_eq!(pool.best_peer_head(), Some(head(10)));
    assert!(pool.allocate(&best_head()).is_ok());
}

#[test]
fn test_allocation_is_exclusive() {
    let (pool, peers) = pool_with(&[50]);

    let ticket = pool.allocate(&best_head()).unwrap();
    assert_eq!(ticket.peer_id(), peers[0]);
    assert!(pool.allocate(&best_head()).is_err());
    assert_eq!(pool.stats().allocated, 1);

    pool.free(ticket, PeerOutcome::Success);
    assert!(pool.allocate(&best_head()).is_ok());
}

#[test]
fn test_dropped_ticket_releases_peer_without_score_change() {
    let (pool, peers) = pool_with(&[50]);

    let ticket = pool.allocate(&best_head()).unwrap();
    drop(ticket);

    let peer = pool.get_peer(&peers[0]).unwrap();
    assert!(!peer.allocated);
    assert_eq!(peer.score, INITIAL_PEER_SCORE);
}

#[test]
fn test_best_head_strategy_prefers_highest_head() {
    let (pool, peers) = pool_with(&[10, 90, 40]);

    let ticket = pool.allocate(&best_head()).unwrap();
    assert_eq!(ticket.peer_id(), peers[1]);
}

#[test]
fn test_min_head_filters_peers() {
    let (pool, peers) = pool_with(&[10, 40]);

    let request = AllocationRequest::new(AllocationStrategy::LeastRecentlyUsed).with_min_head(20);
    let ticket = pool.allocate(&request).unwrap();
    assert_eq!(ticket.peer_id(), peers[1]);
    assert!(pool.allocate(&request).is_err());
}

#[test]
fn test_least_recently_used_rotates() {
    let (pool, _) = pool_with(&[10, 10, 10]);
    let request = AllocationRequest::new(AllocationStrategy::LeastRecentlyUsed);

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let ticket = pool.allocate(&request).unwrap();
        seen.insert(ticket.peer_id());
        pool.free(ticket, PeerOutcome::Success);
    }
    assert_eq!(seen.len(), 3);
}

#[test]
fn test_avoided_peer_is_last_resort() {
    let (pool, peers) = pool_with(&[90, 10]);

    let ticket = pool.allocate(&best_head().avoiding(Some(peers[0]))).unwrap();
    assert_eq!(ticket.peer_id(), peers[1]);
    drop(ticket);

    let (single, only) = pool_with(&[90]);
    let ticket = single.allocate(&best_head().avoiding(Some(only[0]))).unwrap();
    assert_eq!(ticket.peer_id(), only[0]);
}

#[test]
fn test_invalid_data_lowers_score_until_banned() {
    let (pool, peers) = pool_with(&[50]);
    let peer = peers[0];
    let strikes = INITIAL_PEER_SCORE / -SCORE_INVALID_DATA;

    for strike in 1..=strikes {
        let ticket = pool.allocate(&best_head()).unwrap();
        pool.free(ticket, PeerOutcome::InvalidData);
        let score = pool.get_peer(&peer).unwrap().score;
        assert_eq!(score, INITIAL_PEER_SCORE + strike * SCORE_INVALID_DATA);
    }

    assert!(pool.is_banned(&peer));
    assert_eq!(pool.initialized_peers_count(), 0);
    assert!(pool.allocate(&best_head()).is_err());
    assert_eq!(pool.take_disconnect_requests(), vec![peer]);
    assert!(pool.take_disconnect_requests().is_empty());
}

#[test]
fn test_protocol_violations_ban_quickly() {
    let (pool, peers) = pool_with(&[50]);
    for _ in 0..3 {
        pool.report(&peers[0], PeerOutcome::ProtocolViolation);
    }
    assert!(pool.is_banned(&peers[0]));
    assert_eq!(pool.stats().banned, 1);
}

#[test]
fn test_banned_peer_cannot_rejoin() {
    let (pool, peers) = pool_with(&[50]);
    for _ in 0..3 {
        pool.report(&peers[0], PeerOutcome::ProtocolViolation);
    }
    pool.take_disconnect_requests();
    pool.remove_peer(&peers[0]);

    assert!(!pool.add_peer(peers[0]));
    assert_eq!(pool.take_disconnect_requests(), vec![peers[0]]);
}

#[test]
fn test_removed_peer_invalidates_ticket() {
    let (pool, peers) = pool_with(&[50]);
    let ticket = pool.allocate(&best_head()).unwrap();

    pool.remove_peer(&peers[0]);
    assert!(!pool.is_live(&ticket));

    // The freed slot is reused; the stale ticket must not touch the newcomer.
    let newcomer = PeerId::random();
    pool.add_peer(newcomer);
    pool.update_head(&newcomer, head(60));
    pool.free(ticket, PeerOutcome::ProtocolViolation);

    let peer = pool.get_peer(&newcomer).unwrap();
    assert_eq!(peer.score, INITIAL_PEER_SCORE);
    assert_eq!(peer.severe_violations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_puts_peer_to_sleep() {
    let (pool, _) = pool_with(&[50]);

    let ticket = pool.allocate(&best_head()).unwrap();
    pool.free(ticket, PeerOutcome::Timeout);
    assert!(pool.allocate(&best_head()).is_err());

    tokio::time::advance(PEER_TIMEOUT_SLEEP + Duration::from_millis(1)).await;
    assert!(pool.allocate(&best_head()).is_ok());
}

#[tokio::test]
async fn test_changes_signal_on_free() {
    let (pool, _) = pool_with(&[50]);
    let ticket = pool.allocate(&best_head()).unwrap();
    let mut changes = pool.subscribe();

    assert!(!changes.wait_for_change(Duration::from_millis(10)).await);
    pool.free(ticket, PeerOutcome::Success);
    assert!(changes.wait_for_change(Duration::from_millis(10)).await);
}
