use containers::{BlockNumber, Bytes32, ChainHead};
use rstest::rstest;

use crate::sync::{LocalChainState, PeerState, SyncConfig, SyncMode, select_mode};

fn peers(best: Option<BlockNumber>) -> PeerState {
    PeerState {
        initialized_peers: usize::from(best.is_some()),
        best_head: best.map(|number| ChainHead::new(number, Bytes32::ZERO, 0)),
    }
}

fn local(
    best_full_block: BlockNumber,
    pivot: Option<BlockNumber>,
    historical_complete: bool,
    state_complete: bool,
) -> LocalChainState {
    LocalChainState {
        best_full_block,
        pivot,
        historical_complete,
        state_complete,
    }
}

#[rstest]
#[case::no_peers(local(0, None, false, false), None, SyncMode::DISCONNECTED)]
#[case::far_behind_without_pivot(local(0, None, false, false), Some(1000), SyncMode::FAST_SYNC)]
#[case::historical_pending(local(0, Some(936), false, false), Some(1000), SyncMode::FAST_BLOCKS)]
#[case::state_pending(local(0, Some(936), true, false), Some(1000), SyncMode::STATE_NODES)]
#[case::fast_sync_done(local(936, Some(936), true, true), Some(1000), SyncMode::FULL)]
#[case::within_lag(local(980, None, false, false), Some(1000), SyncMode::FULL)]
#[case::caught_up(local(1000, None, false, false), Some(1000), SyncMode::WAITING_FOR_BLOCK)]
#[case::ahead_of_peers(local(1200, None, false, false), Some(1000), SyncMode::WAITING_FOR_BLOCK)]
fn test_select_mode(
    #[case] local: LocalChainState,
    #[case] best: Option<BlockNumber>,
    #[case] expected: SyncMode,
) {
    let mode = select_mode(&SyncConfig::default(), &local, &peers(best));
    assert_eq!(mode, expected);
    assert!(mode.is_consistent());
}

#[test]
fn test_disabled_sync_selects_nothing() {
    let config = SyncConfig {
        enabled: false,
        ..Default::default()
    };
    let mode = select_mode(&config, &local(0, None, false, false), &peers(Some(1000)));
    assert_eq!(mode, SyncMode::NONE);
}

#[test]
fn test_no_peers_is_disconnected_even_when_disabled() {
    let config = SyncConfig {
        enabled: false,
        ..Default::default()
    };
    let mode = select_mode(&config, &local(0, None, false, false), &peers(None));
    assert_eq!(mode, SyncMode::DISCONNECTED);
}

#[test]
fn test_without_fast_sync_goes_full() {
    let config = SyncConfig {
        fast_sync: false,
        ..Default::default()
    };
    let mode = select_mode(&config, &local(0, None, false, false), &peers(Some(1000)));
    assert_eq!(mode, SyncMode::FULL);
}

#[test]
fn test_peer_head_only_counts_when_initialized() {
    let state = PeerState {
        initialized_peers: 0,
        best_head: Some(ChainHead::new(1000, Bytes32::ZERO, 0)),
    };
    let mode = select_mode(&SyncConfig::default(), &local(0, None, false, false), &state);
    assert_eq!(mode, SyncMode::DISCONNECTED);
}
