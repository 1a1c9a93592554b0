//! Generic download pipeline shared by every data class.
//!
//! A feed turns its active target into fixed-size batches, hands each batch
//! to a peer from the pool, validates the response and persists results.
//! Everything that differs between headers, bodies, receipts, state nodes
//! and live blocks is supplied by a [`FeedKind`]; retry, backoff,
//! backpressure and reordering live here once.
use std::{
    collections::BTreeMap,
    fmt::Debug,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use containers::BlockNumber;
use futures::{FutureExt, future::BoxFuture};
use libp2p_identity::PeerId;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{
    batch_buffer::BatchBuffer,
    config::{ALLOCATION_RETRY_DELAY, DEPENDENCY_POLL_INTERVAL, FeedConfig},
    error::{GapError, PeerFault, TransportError},
    peer_pool::{AllocationRequest, AllocationTicket, PeerOutcome, PoolChanges, SyncPeerPool},
    progress::FeedProgress,
    states::FeedState,
};
use crate::types::{ChainStore, DataKind, SyncEvent, SyncTransport};

/// Half-open range of block numbers `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl BlockRange {
    pub fn new(start: BlockNumber, end: BlockNumber) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, number: BlockNumber) -> bool {
        self.start <= number && number < self.end
    }

    /// Split into consecutive batches of at most `batch_size` blocks.
    pub fn split(&self, batch_size: u64) -> Vec<BlockRange> {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = (start + batch_size).min(self.end);
            batches.push(BlockRange::new(start, end));
            start = end;
        }
        batches
    }

    /// Split into batches of at most `batch_size` blocks, highest first.
    /// The batches are aligned to `end`, so only the lowest may be short.
    pub fn split_from_top(&self, batch_size: u64) -> Vec<BlockRange> {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::new();
        let mut end = self.end;
        while end > self.start {
            let start = end.saturating_sub(batch_size).max(self.start);
            batches.push(BlockRange::new(start, end));
            end = start;
        }
        batches
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Work derived from a target and the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<T> {
    pub tasks: Vec<T>,
    /// First item of the target, for progress.
    pub start: BlockNumber,
    /// Items covered by the target, including those already persisted.
    pub total: u64,
    /// Items already persisted when planning.
    pub done: u64,
}

/// A validated response, possibly covering only part of its task.
#[derive(Debug)]
pub struct Checked<T, V> {
    pub data: V,
    /// Part of the task the peer did not serve; queued as a new task.
    pub leftover: Option<T>,
}

impl<T, V> Checked<T, V> {
    pub fn complete(data: V) -> Self {
        Self {
            data,
            leftover: None,
        }
    }
}

/// Result of persisting one batch.
#[derive(Debug)]
pub struct Committed<T> {
    /// Items written.
    pub done: u64,
    /// Follow-up tasks found while persisting (frontier feeds).
    pub discovered: Vec<T>,
    /// Items those tasks add to the total.
    pub discovered_items: u64,
}

impl<T> Committed<T> {
    pub fn done(done: u64) -> Self {
        Self {
            done,
            discovered: Vec::new(),
            discovered_items: 0,
        }
    }
}

#[derive(Debug)]
pub enum CommitError {
    /// The batch is bad after all; blame the peer that served it.
    Fault(PeerFault),
    /// Persistence does not line up with the plan; re-plan.
    Gap(GapError),
}

impl From<GapError> for CommitError {
    fn from(error: GapError) -> Self {
        CommitError::Gap(error)
    }
}

impl From<PeerFault> for CommitError {
    fn from(fault: PeerFault) -> Self {
        CommitError::Fault(fault)
    }
}

/// Capabilities that specialize the feed engine for one data class.
pub trait FeedKind: Send + Sync + 'static {
    type Target: Clone + PartialEq + Debug + Send + Sync + 'static;
    type Task: Clone + Debug + Send + 'static;
    type Request: Clone + Send + 'static;
    type Response: Send + 'static;
    type Valid: Send + 'static;

    /// Whether batches must be persisted in task order.
    const ORDERED: bool;

    fn data_kind(&self) -> DataKind;

    /// Split the part of `target` not yet persisted into tasks.
    fn plan(&self, target: &Self::Target) -> Plan<Self::Task>;

    fn task_items(task: &Self::Task) -> u64;

    fn allocation(&self, target: &Self::Target, task: &Self::Task) -> AllocationRequest;

    /// Build the request for `task`, or `None` while data it depends on
    /// has not been persisted yet.
    fn prepare(&self, target: &Self::Target, task: &Self::Task) -> Option<Self::Request>;

    fn fetch(
        transport: Arc<dyn SyncTransport>,
        peer: PeerId,
        request: Self::Request,
    ) -> BoxFuture<'static, Result<Self::Response, TransportError>>;

    fn validate(
        &self,
        target: &Self::Target,
        task: &Self::Task,
        request: &Self::Request,
        response: Self::Response,
    ) -> Result<Checked<Self::Task, Self::Valid>, PeerFault>;

    fn commit(
        &self,
        target: &Self::Target,
        task: &Self::Task,
        data: Self::Valid,
    ) -> Result<Committed<Self::Task>, CommitError>;
}

/// Plan a block-range target, resuming after whatever is persisted.
pub fn plan_range(
    store: &dyn ChainStore,
    kind: DataKind,
    range: BlockRange,
    batch_size: u64,
) -> Plan<BlockRange> {
    let resume = store
        .next_missing(kind)
        .map_or(range.start, |next| next.clamp(range.start, range.end));
    Plan {
        tasks: BlockRange::new(resume, range.end).split(batch_size),
        start: range.start,
        total: range.len(),
        done: resume - range.start,
    }
}

#[derive(Debug, Clone)]
struct PendingBatch<T> {
    task: T,
    attempts: u32,
    not_before: Instant,
    /// Peer that failed this batch last.
    avoid: Option<PeerId>,
}

impl<T> PendingBatch<T> {
    fn new(task: T) -> Self {
        Self {
            task,
            attempts: 0,
            not_before: Instant::now(),
            avoid: None,
        }
    }
}

struct Completion<K: FeedKind> {
    seq: u64,
    batch: PendingBatch<K::Task>,
    request: K::Request,
    ticket: AllocationTicket,
    result: Result<K::Response, TransportError>,
}

struct Buffered<K: FeedKind> {
    batch: PendingBatch<K::Task>,
    data: K::Valid,
    peer: PeerId,
}

/// One feed and its in-flight requests.
pub struct Feed<K: FeedKind> {
    kind: K,
    pool: SyncPeerPool,
    pool_changes: PoolChanges,
    transport: Arc<dyn SyncTransport>,
    config: FeedConfig,
    progress: Arc<FeedProgress>,
    state: FeedState,
    target: Option<K::Target>,
    next_seq: u64,
    pending: BTreeMap<u64, PendingBatch<K::Task>>,
    in_flight: JoinSet<Completion<K>>,
    buffer: BatchBuffer<Buffered<K>>,
    /// Items in flight or buffered but not yet persisted.
    queued_items: u64,
    waiting_for_peer: bool,
}

impl<K: FeedKind> Feed<K> {
    pub fn new(
        kind: K,
        pool: SyncPeerPool,
        transport: Arc<dyn SyncTransport>,
        config: FeedConfig,
    ) -> Self {
        let progress = Arc::new(FeedProgress::new(kind.data_kind()));
        Self {
            pool_changes: pool.subscribe(),
            kind,
            pool,
            transport,
            config,
            progress,
            state: FeedState::default(),
            target: None,
            next_seq: 0,
            pending: BTreeMap::new(),
            in_flight: JoinSet::new(),
            buffer: BatchBuffer::default(),
            queued_items: 0,
            waiting_for_peer: false,
        }
    }

    pub fn data_kind(&self) -> DataKind {
        self.kind.data_kind()
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn target(&self) -> Option<&K::Target> {
        self.target.as_ref()
    }

    pub fn progress(&self) -> Arc<FeedProgress> {
        self.progress.clone()
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_items(&self) -> u64 {
        self.queued_items
    }

    /// Begin or resume work on `target`.
    ///
    /// Re-activating with the target already being worked on is a no-op.
    /// Any other target discards in-flight work and re-plans from the
    /// persisted state.
    pub fn activate(&mut self, target: K::Target) {
        if self.state != FeedState::Dormant && self.target.as_ref() == Some(&target) {
            return;
        }

        info!(kind = %self.data_kind(), ?target, "Activating feed");
        self.target = Some(target);
        self.replan();
        self.set_state(FeedState::Active);
    }

    /// Stop dispatching. In-flight requests are abandoned and their peers
    /// released; nothing partial is kept.
    pub fn deactivate(&mut self) {
        if self.state == FeedState::Dormant {
            return;
        }

        debug!(
            kind = %self.data_kind(),
            in_flight = self.in_flight.len(),
            "Deactivating feed"
        );
        self.clear_work();
        self.target = None;
        self.set_state(FeedState::Dormant);
    }

    /// No more items are expected for the current target.
    pub fn mark_end(&mut self) {
        self.clear_work();
        self.progress.mark_end();
        self.set_state(FeedState::Finished);
    }

    /// Drive the feed once: dispatch what can be dispatched, then wait for
    /// a completion, a retry deadline or a pool change.
    ///
    /// Returns true when this step finished the active range.
    pub async fn step(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }

        self.dispatch();

        if self.pending.is_empty() && self.in_flight.is_empty() && self.buffer.is_empty() {
            info!(kind = %self.data_kind(), "Feed finished");
            self.mark_end();
            return true;
        }

        let wake = self.next_wake();
        tokio::select! {
            Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                match joined {
                    Ok(completion) => self.on_completion(completion),
                    Err(error) => warn!(kind = %self.data_kind(), %error, "Feed request task failed"),
                }
            }
            _ = tokio::time::sleep_until(wake) => {}
            _ = self.pool_changes.changed() => {}
        }

        false
    }

    pub async fn run_until_finished(&mut self) {
        while self.state.is_active() {
            if self.step().await {
                break;
            }
        }
    }

    /// Move the feed into its own task, controlled through the returned
    /// handle. Finishing a range is reported on `events`.
    pub fn spawn(self, events: mpsc::UnboundedSender<SyncEvent>) -> FeedHandle<K::Target> {
        let (commands, receiver) = watch::channel(FeedCommand::Idle);
        let kind = self.data_kind();
        let progress = self.progress();
        let task = tokio::spawn(drive(self, receiver, events));
        FeedHandle {
            kind,
            commands,
            progress,
            task,
        }
    }

    fn set_state(&mut self, target: FeedState) {
        if !self.state.can_transition_to(target) {
            warn!(
                kind = %self.data_kind(),
                from = ?self.state,
                to = ?target,
                "Invalid feed state transition attempted"
            );
            return;
        }
        self.state = target;
    }

    fn replan(&mut self) {
        self.clear_work();

        let Some(target) = self.target.as_ref() else {
            return;
        };
        let plan = self.kind.plan(target);
        self.progress
            .reset(plan.start, plan.start.saturating_add(plan.total));
        self.progress.add_done(plan.done);

        debug!(
            kind = %self.data_kind(),
            tasks = plan.tasks.len(),
            total = plan.total,
            done = plan.done,
            "Planned feed"
        );

        self.next_seq = 0;
        self.buffer.reset(0);
        for task in plan.tasks {
            self.enqueue(task);
        }
    }

    /// Abandon everything in flight, pending or buffered.
    fn clear_work(&mut self) {
        if !self.in_flight.is_empty() {
            self.in_flight.abort_all();
            let mut drained = std::mem::take(&mut self.in_flight);
            let kind = self.data_kind();
            // Aborted requests drop their tickets, which frees the peers.
            tokio::spawn(async move {
                let mut released = 0;
                while let Some(joined) = drained.join_next().await {
                    if let Ok(completion) = joined {
                        drop(completion);
                    }
                    released += 1;
                }
                debug!(%kind, released, "Drained abandoned requests");
            });
        }
        self.pending.clear();
        self.buffer.reset(0);
        self.queued_items = 0;
        self.progress.clear_queued();
        self.waiting_for_peer = false;
    }

    fn enqueue(&mut self, task: K::Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, PendingBatch::new(task));
    }

    fn queue(&mut self, items: u64) {
        self.queued_items += items;
        self.progress.add_queued(items);
    }

    fn unqueue(&mut self, items: u64) {
        self.queued_items = self.queued_items.saturating_sub(items);
        self.progress.remove_queued(items);
    }

    fn backpressured(&self) -> bool {
        K::ORDERED && self.queued_items > self.config.max_queued_items
    }

    fn dispatch(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let now = Instant::now();
        self.waiting_for_peer = false;

        let ready: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, batch)| batch.not_before <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in ready {
            if self.in_flight.len() >= self.config.max_in_flight {
                break;
            }
            // Over the queue bound only the batch that unblocks persistence
            // may go out.
            if self.backpressured() && seq != self.buffer.next_seq() {
                continue;
            }

            let Some(batch) = self.pending.get_mut(&seq) else {
                continue;
            };
            let Some(request) = self.kind.prepare(&target, &batch.task) else {
                batch.not_before = now + DEPENDENCY_POLL_INTERVAL;
                continue;
            };

            let allocation = self
                .kind
                .allocation(&target, &batch.task)
                .avoiding(batch.avoid);
            let ticket = match self.pool.allocate(&allocation) {
                Ok(ticket) => ticket,
                Err(_) => {
                    self.waiting_for_peer = true;
                    break;
                }
            };

            let Some(batch) = self.pending.remove(&seq) else {
                continue;
            };
            self.send(seq, batch, request, ticket);
        }
    }

    fn send(
        &mut self,
        seq: u64,
        batch: PendingBatch<K::Task>,
        request: K::Request,
        ticket: AllocationTicket,
    ) {
        let peer = ticket.peer_id();
        let items = K::task_items(&batch.task);
        self.queue(items);

        debug!(
            kind = %self.data_kind(),
            peer = %peer,
            seq,
            task = ?batch.task,
            attempt = batch.attempts + 1,
            "Requesting batch"
        );

        let fetch = K::fetch(self.transport.clone(), peer, request.clone());
        let timeout = self.config.request_timeout;
        self.in_flight.spawn(async move {
            let result = match tokio::time::timeout(timeout, AssertUnwindSafe(fetch).catch_unwind())
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TransportError::ProtocolViolation(
                    "transport panicked".to_owned(),
                )),
                Err(_) => Err(TransportError::Timeout),
            };
            Completion {
                seq,
                batch,
                request,
                ticket,
                result,
            }
        });
    }

    fn next_wake(&self) -> Instant {
        let now = Instant::now();
        let mut wake = self
            .pending
            .values()
            .map(|batch| batch.not_before)
            .filter(|at| *at > now)
            .min();
        if self.waiting_for_peer {
            let retry = now + ALLOCATION_RETRY_DELAY;
            wake = Some(wake.map_or(retry, |at| at.min(retry)));
        }
        wake.unwrap_or(now + DEPENDENCY_POLL_INTERVAL)
    }

    fn on_completion(&mut self, completion: Completion<K>) {
        let Completion {
            seq,
            batch,
            request,
            ticket,
            result,
        } = completion;
        self.unqueue(K::task_items(&batch.task));

        let Some(target) = self.target.clone() else {
            return;
        };

        // The peer went away mid-request; not its fault.
        if !self.pool.is_live(&ticket) {
            debug!(kind = %self.data_kind(), seq, "Peer left during request, re-queueing");
            drop(ticket);
            self.pending.insert(seq, PendingBatch { avoid: None, ..batch });
            return;
        }

        let peer = ticket.peer_id();
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                debug!(kind = %self.data_kind(), peer = %peer, seq, %error, "Batch request failed");
                self.pool.free(ticket, error.outcome());
                self.retry(seq, batch, peer);
                return;
            }
        };

        let checked = match self.kind.validate(&target, &batch.task, &request, response) {
            Ok(checked) => checked,
            Err(fault) => {
                warn!(kind = %self.data_kind(), peer = %peer, seq, %fault, "Peer served bad batch");
                self.pool.free(ticket, fault.outcome());
                self.retry(seq, batch, peer);
                return;
            }
        };
        self.pool.free(ticket, PeerOutcome::Success);

        if let Some(leftover) = checked.leftover {
            self.enqueue(leftover);
        }

        if K::ORDERED {
            self.queue(K::task_items(&batch.task));
            self.buffer.insert(
                seq,
                Buffered {
                    batch,
                    data: checked.data,
                    peer,
                },
            );
            self.flush(&target);
        } else {
            self.commit(&target, seq, batch, checked.data, peer);
        }
    }

    fn retry(&mut self, seq: u64, mut batch: PendingBatch<K::Task>, peer: PeerId) {
        batch.attempts += 1;
        batch.not_before = Instant::now() + self.config.backoff.delay(batch.attempts);
        batch.avoid = Some(peer);
        self.pending.insert(seq, batch);
    }

    /// Persist buffered batches for as long as they continue the
    /// persisted range.
    fn flush(&mut self, target: &K::Target) {
        while let Some((seq, entry)) = self.buffer.take_ready() {
            self.unqueue(K::task_items(&entry.batch.task));
            let Buffered { batch, data, peer } = entry;
            if !self.commit(target, seq, batch, data, peer) {
                break;
            }
            self.buffer.advance();
        }
    }

    /// Returns false if the batch was not persisted.
    fn commit(
        &mut self,
        target: &K::Target,
        seq: u64,
        batch: PendingBatch<K::Task>,
        data: K::Valid,
        peer: PeerId,
    ) -> bool {
        match self.kind.commit(target, &batch.task, data) {
            Ok(committed) => {
                self.progress.add_done(committed.done);
                if committed.discovered_items > 0 {
                    self.progress.add_total(committed.discovered_items);
                }
                for task in committed.discovered {
                    self.enqueue(task);
                }
                true
            }
            Err(CommitError::Fault(fault)) => {
                warn!(kind = %self.data_kind(), peer = %peer, seq, %fault, "Batch rejected on persist");
                self.pool.report(&peer, fault.outcome());
                self.retry(seq, batch, peer);
                false
            }
            Err(CommitError::Gap(gap)) => {
                warn!(kind = %self.data_kind(), %gap, "Persistence gap, re-planning feed");
                self.replan();
                false
            }
        }
    }
}

/// Desired state of a spawned feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand<T> {
    Idle,
    Run(T),
}

/// Control side of a spawned feed.
#[derive(Debug)]
pub struct FeedHandle<T> {
    kind: DataKind,
    commands: watch::Sender<FeedCommand<T>>,
    progress: Arc<FeedProgress>,
    task: JoinHandle<()>,
}

impl<T: Clone + PartialEq> FeedHandle<T> {
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn progress(&self) -> Arc<FeedProgress> {
        self.progress.clone()
    }

    /// Returns true if the target changed.
    pub fn activate(&self, target: T) -> bool {
        self.commands.send_if_modified(|command| {
            let next = FeedCommand::Run(target);
            if *command == next {
                return false;
            }
            *command = next;
            true
        })
    }

    pub fn deactivate(&self) -> bool {
        self.commands.send_if_modified(|command| {
            if *command == FeedCommand::Idle {
                return false;
            }
            *command = FeedCommand::Idle;
            true
        })
    }

    pub fn target(&self) -> Option<T> {
        match &*self.commands.borrow() {
            FeedCommand::Idle => None,
            FeedCommand::Run(target) => Some(target.clone()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.commands.borrow(), FeedCommand::Run(_))
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn drive<K: FeedKind>(
    mut feed: Feed<K>,
    mut commands: watch::Receiver<FeedCommand<K::Target>>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let kind = feed.data_kind();
    loop {
        let command = commands.borrow_and_update().clone();
        match command {
            FeedCommand::Idle => feed.deactivate(),
            FeedCommand::Run(target) => feed.activate(target),
        }

        let changed = loop {
            if !feed.state().is_active() {
                break commands.changed().await;
            }
            tokio::select! {
                changed = commands.changed() => break changed,
                finished = feed.step() => {
                    if finished && events.send(SyncEvent::FeedFinished(kind)).is_err() {
                        feed.deactivate();
                        return;
                    }
                }
            }
        };

        if changed.is_err() {
            feed.deactivate();
            return;
        }
    }
}
