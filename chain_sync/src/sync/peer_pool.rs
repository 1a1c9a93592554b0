/// Peer pool for sync operations.
///
/// Tracks connected peers, their advertised heads and reputation, and hands
/// out exclusive allocation tickets to feeds.
use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use containers::{BlockNumber, ChainHead};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, warn};

use super::{
    config::{
        BAN_SCORE, INITIAL_PEER_SCORE, LOW_SCORE_THRESHOLD, MAX_PEER_SCORE, MAX_SEVERE_VIOLATIONS,
        PEER_TIMEOUT_SLEEP, SCORE_INVALID_DATA, SCORE_PROTOCOL_VIOLATION, SCORE_SUCCESS,
        SCORE_TIMEOUT,
    },
    error::PeerUnavailable,
};

/// How a request served by a peer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Success,
    Timeout,
    InvalidData,
    ProtocolViolation,
}

impl PeerOutcome {
    fn score_delta(&self) -> i32 {
        match self {
            PeerOutcome::Success => SCORE_SUCCESS,
            PeerOutcome::Timeout => SCORE_TIMEOUT,
            PeerOutcome::InvalidData => SCORE_INVALID_DATA,
            PeerOutcome::ProtocolViolation => SCORE_PROTOCOL_VIOLATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Prefer the peer advertising the highest head.
    BestHead,
    /// Spread load: prefer the peer idle for the longest time.
    LeastRecentlyUsed,
}

/// What a feed needs from the peer it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub strategy: AllocationStrategy,
    /// Peer head must be at least this high.
    pub min_head: Option<BlockNumber>,
    /// Prefer any other peer over this one. Falls back to it when it is the
    /// only candidate.
    pub avoid: Option<PeerId>,
}

impl AllocationRequest {
    pub fn new(strategy: AllocationStrategy) -> Self {
        Self {
            strategy,
            min_head: None,
            avoid: None,
        }
    }

    pub fn with_min_head(mut self, min_head: BlockNumber) -> Self {
        self.min_head = Some(min_head);
        self
    }

    pub fn avoiding(mut self, peer: Option<PeerId>) -> Self {
        self.avoid = peer;
        self
    }
}

/// Arena slot index plus the generation it was issued for.
///
/// A slot's generation is bumped whenever its peer is removed, so a key
/// handed out earlier can never alias a peer added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    index: usize,
    generation: u64,
}

/// Sync-specific peer state.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    /// `None` until the handshake reported a head.
    pub head: Option<ChainHead>,
    pub score: i32,
    pub severe_violations: u32,
    pub allocated: bool,
    pub banned: bool,
    pub last_allocated: Option<Instant>,
    pub sleeping_until: Option<Instant>,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            head: None,
            score: INITIAL_PEER_SCORE,
            severe_violations: 0,
            allocated: false,
            banned: false,
            last_allocated: None,
            sleeping_until: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.head.is_some() && !self.banned
    }

    pub fn head_number(&self) -> Option<BlockNumber> {
        self.head.map(|head| head.number)
    }

    /// Check if peer can take a new request.
    pub fn is_available(&self, now: Instant) -> bool {
        self.is_initialized()
            && !self.allocated
            && self.sleeping_until.is_none_or(|until| until <= now)
    }

    pub fn is_low_score(&self) -> bool {
        self.score < LOW_SCORE_THRESHOLD
    }

    /// Apply a request outcome. Returns true if the peer just got banned.
    fn apply(&mut self, outcome: PeerOutcome, now: Instant) -> bool {
        self.score = (self.score + outcome.score_delta()).min(MAX_PEER_SCORE);
        match outcome {
            PeerOutcome::Timeout => self.sleeping_until = Some(now + PEER_TIMEOUT_SLEEP),
            PeerOutcome::ProtocolViolation => self.severe_violations += 1,
            PeerOutcome::Success | PeerOutcome::InvalidData => {}
        }

        if !self.banned
            && (self.score <= BAN_SCORE || self.severe_violations >= MAX_SEVERE_VIOLATIONS)
        {
            self.banned = true;
            return true;
        }
        false
    }
}

/// Counters for the report and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub connected: usize,
    pub initialized: usize,
    pub allocated: usize,
    pub banned: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    peer: Option<SyncPeer>,
}

#[derive(Debug, Default)]
struct PoolInner {
    slots: Vec<Slot>,
    index: HashMap<PeerId, usize>,
    vacant: Vec<usize>,
    banned: HashSet<PeerId>,
    disconnect_requests: Vec<PeerId>,
}

impl PoolInner {
    fn peer(&self, key: PeerKey) -> Option<&SyncPeer> {
        let slot = self.slots.get(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.peer.as_ref()
    }

    fn peer_mut(&mut self, key: PeerKey) -> Option<&mut SyncPeer> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.peer.as_mut()
    }

    fn key_of(&self, peer_id: &PeerId) -> Option<PeerKey> {
        let index = *self.index.get(peer_id)?;
        Some(PeerKey {
            index,
            generation: self.slots[index].generation,
        })
    }

    fn peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.slots.iter().filter_map(|slot| slot.peer.as_ref())
    }

    fn apply_outcome(&mut self, key: PeerKey, outcome: PeerOutcome) {
        let now = Instant::now();
        let Some(peer) = self.peer_mut(key) else {
            return;
        };
        let peer_id = peer.peer_id;
        let newly_banned = peer.apply(outcome, now);
        let score = peer.score;

        match outcome {
            PeerOutcome::Success => {}
            _ => debug!(peer = %peer_id, ?outcome, score, "Peer penalized"),
        }

        if newly_banned {
            warn!(peer = %peer_id, score, "Banning peer");
            self.banned.insert(peer_id);
            self.disconnect_requests.push(peer_id);
        }
    }
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    changes: watch::Sender<u64>,
}

impl PoolShared {
    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn release(&self, key: PeerKey, outcome: Option<PeerOutcome>) {
        {
            let mut inner = self.inner.lock();
            match inner.peer_mut(key) {
                Some(peer) => peer.allocated = false,
                // Peer was removed while allocated.
                None => return,
            }
            if let Some(outcome) = outcome {
                inner.apply_outcome(key, outcome);
            }
        }
        self.notify();
    }
}

/// Exclusive right to send one request to a peer.
///
/// Dropping a ticket without [`SyncPeerPool::free`] releases the peer with
/// no score change.
#[derive(Debug)]
pub struct AllocationTicket {
    key: PeerKey,
    peer_id: PeerId,
    pool: Weak<PoolShared>,
    released: bool,
}

impl AllocationTicket {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }
}

impl Drop for AllocationTicket {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.key, None);
        }
    }
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared").finish_non_exhaustive()
    }
}

/// Waits for pool changes: frees, joins, leaves and head updates.
#[derive(Debug, Clone)]
pub struct PoolChanges {
    rx: watch::Receiver<u64>,
}

impl PoolChanges {
    /// Resolves on the next change after the last one observed.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            // Pool dropped: nothing will ever change again.
            std::future::pending::<()>().await;
        }
    }

    /// Bounded wait. Returns true if the pool changed.
    pub async fn wait_for_change(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.changed()).await.is_ok()
    }
}

/// Shared registry of sync peers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncPeerPool {
    shared: Arc<PoolShared>,
}

impl Default for SyncPeerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncPeerPool {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner::default()),
                changes,
            }),
        }
    }

    pub fn subscribe(&self) -> PoolChanges {
        PoolChanges {
            rx: self.shared.changes.subscribe(),
        }
    }

    /// Add a peer on transport connect. Returns false for known or banned
    /// peers.
    pub fn add_peer(&self, peer_id: PeerId) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            if inner.index.contains_key(&peer_id) {
                return false;
            }
            if inner.banned.contains(&peer_id) {
                debug!(peer = %peer_id, "Rejecting banned peer");
                inner.disconnect_requests.push(peer_id);
                return false;
            }

            let index = match inner.vacant.pop() {
                Some(index) => index,
                None => {
                    inner.slots.push(Slot::default());
                    inner.slots.len() - 1
                }
            };
            inner.slots[index].peer = Some(SyncPeer::new(peer_id));
            inner.index.insert(peer_id, index);
        }

        info!(peer = %peer_id, "Peer added to sync pool");
        self.shared.notify();
        true
    }

    /// Remove a peer on transport disconnect.
    ///
    /// Never waits for the peer's ticket holder; the holder finds out the
    /// next time it uses the ticket.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        let removed = {
            let mut inner = self.shared.inner.lock();
            let index = inner.index.remove(peer_id)?;
            let slot = &mut inner.slots[index];
            slot.generation += 1;
            let removed = slot.peer.take();
            inner.vacant.push(index);
            removed
        };

        info!(peer = %peer_id, "Peer removed from sync pool");
        self.shared.notify();
        removed
    }

    /// Record a peer's advertised head. The first update completes the
    /// handshake and makes the peer allocatable.
    pub fn update_head(&self, peer_id: &PeerId, head: ChainHead) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            let Some(key) = inner.key_of(peer_id) else {
                return false;
            };
            let Some(peer) = inner.peer_mut(key) else {
                return false;
            };
            if peer.head == Some(head) {
                return true;
            }
            peer.head = Some(head);
        }

        debug!(peer = %peer_id, head = head.number, "Updated peer head");
        self.shared.notify();
        true
    }

    /// Hand out an unallocated, initialized peer matching `request`.
    pub fn allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<AllocationTicket, PeerUnavailable> {
        let now = Instant::now();
        let mut inner = self.shared.inner.lock();

        let candidates = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let peer = slot.peer.as_ref()?;
                let key = PeerKey {
                    index,
                    generation: slot.generation,
                };
                Some((key, peer))
            })
            .filter(|(_, peer)| peer.is_available(now))
            .filter(|(_, peer)| {
                request
                    .min_head
                    .is_none_or(|min| peer.head_number().is_some_and(|head| head >= min))
            });

        let preferred = |peer: &SyncPeer| {
            (
                request.avoid != Some(peer.peer_id),
                !peer.is_low_score(),
            )
        };

        let chosen = match request.strategy {
            AllocationStrategy::BestHead => candidates
                .max_by_key(|(_, peer)| (preferred(peer), peer.head_number(), peer.score))
                .map(|(key, _)| key),
            AllocationStrategy::LeastRecentlyUsed => candidates
                .max_by_key(|(_, peer)| {
                    (preferred(peer), Reverse(peer.last_allocated), peer.score)
                })
                .map(|(key, _)| key),
        };

        let key = chosen.ok_or(PeerUnavailable)?;
        let peer = inner.peer_mut(key).ok_or(PeerUnavailable)?;
        peer.allocated = true;
        peer.last_allocated = Some(now);

        Ok(AllocationTicket {
            key,
            peer_id: peer.peer_id,
            pool: Arc::downgrade(&self.shared),
            released: false,
        })
    }

    /// Release a peer and score the request it served.
    pub fn free(&self, mut ticket: AllocationTicket, outcome: PeerOutcome) {
        ticket.released = true;
        self.shared.release(ticket.key, Some(outcome));
    }

    /// Whether the ticket still refers to a connected peer.
    pub fn is_live(&self, ticket: &AllocationTicket) -> bool {
        self.shared.inner.lock().peer(ticket.key).is_some()
    }

    /// Penalize a peer for data found bad after its ticket was freed.
    pub fn report(&self, peer_id: &PeerId, outcome: PeerOutcome) {
        {
            let mut inner = self.shared.inner.lock();
            let Some(key) = inner.key_of(peer_id) else {
                return;
            };
            inner.apply_outcome(key, outcome);
        }
        self.shared.notify();
    }

    /// Peers that reported a head and are not banned.
    pub fn initialized_peers_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .peers()
            .filter(|peer| peer.is_initialized())
            .count()
    }

    pub fn best_peer_head(&self) -> Option<ChainHead> {
        self.shared
            .inner
            .lock()
            .peers()
            .filter(|peer| peer.is_initialized())
            .filter_map(|peer| peer.head)
            .max_by_key(|head| (head.number, head.total_difficulty))
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        let inner = self.shared.inner.lock();
        let key = inner.key_of(peer_id)?;
        inner.peer(key).cloned()
    }

    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.shared.inner.lock().banned.contains(peer_id)
    }

    /// Drain peers the transport should disconnect.
    pub fn take_disconnect_requests(&self) -> Vec<PeerId> {
        std::mem::take(&mut self.shared.inner.lock().disconnect_requests)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        inner.peers().fold(PoolStats::default(), |mut stats, peer| {
            stats.connected += 1;
            stats.initialized += peer.is_initialized() as usize;
            stats.allocated += peer.allocated as usize;
            stats.banned += peer.banned as usize;
            stats
        })
    }
}
