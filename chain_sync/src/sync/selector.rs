/// Sync mode selection.
///
/// A pure function from what we have locally and what the peers advertise
/// to the set of active phases. It is evaluated by the service on every
/// relevant event and never blocks.
use containers::{BlockNumber, ChainHead};

use super::{config::SyncConfig, mode::SyncMode};

/// What the local node has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalChainState {
    pub best_full_block: BlockNumber,
    /// Pivot number, once resolved.
    pub pivot: Option<BlockNumber>,
    /// Headers, bodies and receipts below the pivot are all stored.
    pub historical_complete: bool,
    /// State at the pivot is stored.
    pub state_complete: bool,
}

/// What the network advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerState {
    pub initialized_peers: usize,
    pub best_head: Option<ChainHead>,
}

pub fn select_mode(config: &SyncConfig, local: &LocalChainState, peers: &PeerState) -> SyncMode {
    let best_head = match peers.best_head {
        Some(head) if peers.initialized_peers > 0 => head.number,
        _ => return SyncMode::DISCONNECTED,
    };

    if !config.enabled {
        return SyncMode::NONE;
    }

    let behind = best_head.saturating_sub(local.best_full_block);
    let fast_incomplete = !local.historical_complete || !local.state_complete;
    if config.fast_sync && behind > config.fast_sync_lag && fast_incomplete {
        return match local.pivot {
            None => SyncMode::FAST_SYNC,
            Some(_) if !local.historical_complete => SyncMode::FAST_BLOCKS,
            Some(_) => SyncMode::STATE_NODES,
        };
    }

    if best_head > local.best_full_block {
        return SyncMode::FULL;
    }

    SyncMode::WAITING_FOR_BLOCK
}
