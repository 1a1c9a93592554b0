//! Fast-sync pivot: the trusted block that bounds historical and state work.
use std::{sync::Arc, time::Duration};

use containers::{BlockHeader, BlockNumber, Bytes32, Checkpoint};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    config::{PivotNumber, SyncConfig},
    error::{PeerFault, SyncError, TransportError, ValidationError},
    feed::BlockRange,
    peer_pool::{AllocationRequest, AllocationStrategy, PeerOutcome, SyncPeerPool},
};
use crate::types::SyncTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pivot {
    pub header: BlockHeader,
}

impl Pivot {
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }

    pub fn state_root(&self) -> Bytes32 {
        self.header.state_root
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::of(&self.header)
    }
}

/// Current pivot and the bookkeeping that decides when to move it.
#[derive(Debug)]
pub struct PivotTracker {
    pivot_number: PivotNumber,
    pivot_hash: Option<Bytes32>,
    distance_from_head: u64,
    max_lag: u64,
    stall_timeout: Duration,
    current: Option<Pivot>,
    state_done: u64,
    state_progress_at: Instant,
}

impl PivotTracker {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            pivot_number: config.pivot_number,
            pivot_hash: config.pivot_hash,
            distance_from_head: config.pivot_distance_from_head,
            max_lag: config.pivot_max_lag,
            stall_timeout: config.pivot_stall_timeout(),
            current: None,
            state_done: 0,
            state_progress_at: Instant::now(),
        }
    }

    pub fn current(&self) -> Option<&Pivot> {
        self.current.as_ref()
    }

    /// Block number to resolve the pivot at, given the best peer head.
    ///
    /// A configured number is used for the first pivot only; advancing
    /// always follows the head.
    pub fn target_number(&self, best_head: BlockNumber) -> BlockNumber {
        match (self.pivot_number, &self.current) {
            (PivotNumber::Number(number), None) => number,
            _ => best_head.saturating_sub(self.distance_from_head).max(1),
        }
    }

    /// Hash the resolved header must match, if one is pinned.
    pub fn expected_hash(&self, number: BlockNumber) -> Option<Bytes32> {
        match self.pivot_number {
            PivotNumber::Number(pinned) if pinned == number => self.pivot_hash,
            _ => None,
        }
    }

    /// Install a resolved pivot. Only ever moves forward.
    pub fn accept(&mut self, header: BlockHeader) -> bool {
        if let Some(expected) = self.expected_hash(header.number) {
            if header.hash() != expected {
                warn!(number = header.number, "Pivot header does not match configured hash");
                return false;
            }
        }
        if let Some(current) = &self.current {
            if header.number <= current.number() {
                debug!(
                    current = current.number(),
                    candidate = header.number,
                    "Ignoring pivot that does not advance"
                );
                return false;
            }
        }

        info!(
            number = header.number,
            hash = %header.hash().short(),
            "Pivot selected"
        );
        self.current = Some(Pivot { header });
        self.state_progress_at = Instant::now();
        true
    }

    /// Ancient range for a data class with the given barrier:
    /// `[barrier, pivot)`, or `[0, pivot)` without a barrier.
    pub fn ancient_range(&self, barrier: Option<BlockNumber>) -> Option<BlockRange> {
        let pivot = self.current.as_ref()?.number();
        let start = match barrier {
            Some(barrier) if barrier > pivot => {
                warn!(barrier, pivot, "Barrier above pivot, clamping");
                pivot
            }
            Some(barrier) => barrier,
            None => 0,
        };
        Some(BlockRange::new(start, pivot))
    }

    /// Feed the state download's done counter; any increase counts as
    /// progress.
    pub fn note_state_progress(&mut self, done: u64) {
        if done != self.state_done {
            self.state_done = done;
            self.state_progress_at = Instant::now();
        }
    }

    /// Whether state sync has stalled long enough, and the head moved far
    /// enough, to warrant a newer pivot.
    pub fn should_advance(&self, best_head: BlockNumber) -> bool {
        let Some(pivot) = &self.current else {
            return false;
        };
        best_head.saturating_sub(pivot.number()) > self.max_lag
            && self.state_progress_at.elapsed() >= self.stall_timeout
    }
}

/// Fetch the header at `number` from the best peer that has it.
pub async fn resolve_pivot_header(
    pool: &SyncPeerPool,
    transport: &Arc<dyn SyncTransport>,
    number: BlockNumber,
    expected_hash: Option<Bytes32>,
    timeout: Duration,
) -> Result<BlockHeader, SyncError> {
    let request = AllocationRequest::new(AllocationStrategy::BestHead).with_min_head(number);
    let ticket = pool.allocate(&request)?;
    let peer = ticket.peer_id();
    debug!(peer = %peer, number, "Requesting pivot header");

    let result = match tokio::time::timeout(timeout, transport.request_headers(peer, number, 1)).await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    };

    let fault = match result {
        Err(error) => PeerFault::from(error),
        Ok(headers) => match headers.into_iter().next() {
            None => PeerFault::Empty,
            Some(header) if header.number != number => ValidationError::UnexpectedNumber {
                expected: number,
                actual: header.number,
            }
            .into(),
            Some(header) if expected_hash.is_some_and(|hash| header.hash() != hash) => {
                ValidationError::AnchorMismatch.into()
            }
            Some(header) => {
                pool.free(ticket, PeerOutcome::Success);
                return Ok(header);
            }
        },
    };

    warn!(peer = %peer, number, %fault, "Pivot resolution failed");
    pool.free(ticket, fault.outcome());
    Err(fault.into())
}
