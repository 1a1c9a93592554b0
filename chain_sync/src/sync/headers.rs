/// Ancient header download.
///
/// Headers below the pivot are fetched backward, starting from the pivot.
/// A batch is persisted only once its highest header hashes to the
/// `parent_hash` of the lowest header already trusted above it, so every
/// stored header is linked to the pivot. Batches that arrive early wait in
/// the feed's reorder buffer until the batch above them is stored.
///
/// After a pivot advance the gap between the stored range and the new
/// pivot is filled the same way. Those batches are held here until the
/// run reaches the top of the stored range, then appended in one write.
use std::sync::Arc;

use containers::{BlockHeader, Bytes32};
use futures::{FutureExt, future::BoxFuture};
use libp2p_identity::PeerId;
use parking_lot::Mutex;

use super::{
    error::{GapError, PeerFault, TransportError, ValidationError},
    feed::{BlockRange, Checked, CommitError, Committed, FeedKind, Plan},
    peer_pool::{AllocationRequest, AllocationStrategy},
};
use crate::types::{BlockValidator, ChainItems, ChainStore, DataKind, SyncTransport};

/// Ancient headers up to the pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTarget {
    pub range: BlockRange,
    /// Hash the header at `range.end - 1` must have: the pivot's parent.
    pub last_hash: Option<Bytes32>,
}

impl HeaderTarget {
    /// Everything between genesis, which is always local, and the pivot.
    pub fn to_pivot(pivot: &BlockHeader) -> Self {
        Self {
            range: BlockRange::new(1, pivot.number),
            last_hash: Some(pivot.parent_hash),
        }
    }
}

pub struct HeadersKind {
    store: Arc<dyn ChainStore>,
    validator: Arc<dyn BlockValidator>,
    batch_size: u64,

    /// Verified headers above the stored range, lowest first
    held: Mutex<Vec<BlockHeader>>,
}

impl HeadersKind {
    pub fn new(
        store: Arc<dyn ChainStore>,
        validator: Arc<dyn BlockValidator>,
        batch_size: u64,
    ) -> Self {
        Self {
            store,
            validator,
            batch_size,
            held: Mutex::new(Vec::new()),
        }
    }

    fn stored(&self) -> Option<BlockRange> {
        let low = self.store.lowest_stored(DataKind::Headers)?;
        let high = self.store.next_missing(DataKind::Headers)?;
        Some(BlockRange::new(low, high))
    }

    /// Hash the highest header of `task` must have: the parent of the
    /// trusted header directly above it.
    fn anchor_above(
        &self,
        target: &HeaderTarget,
        task: &BlockRange,
    ) -> Result<Option<Bytes32>, GapError> {
        if task.end == target.range.end {
            return Ok(target.last_hash);
        }
        if let Some(lowest) = self.held.lock().first() {
            if lowest.number == task.end {
                return Ok(Some(lowest.parent_hash));
            }
        }
        let lowest_stored = self.store.lowest_stored(DataKind::Headers);
        match lowest_stored
            .filter(|lowest| *lowest == task.end)
            .and_then(|lowest| self.store.header(lowest))
        {
            Some(header) => Ok(Some(header.parent_hash)),
            None => Err(GapError {
                kind: DataKind::Headers,
                start: task.start,
                expected: lowest_stored.and_then(|lowest| lowest.checked_sub(task.len())),
            }),
        }
    }
}

/// Check that `headers` are exactly the blocks of `range`, in order and
/// hash-linked among themselves.
pub(crate) fn check_header_batch(
    validator: &dyn BlockValidator,
    range: BlockRange,
    headers: &[BlockHeader],
) -> Result<(), PeerFault> {
    if headers.is_empty() {
        return Err(PeerFault::Empty);
    }
    if headers.len() as u64 != range.len() {
        return Err(PeerFault::WrongCount {
            expected: range.len() as usize,
            actual: headers.len(),
        });
    }
    for (expected, header) in (range.start..).zip(headers) {
        if header.number != expected {
            return Err(ValidationError::UnexpectedNumber {
                expected,
                actual: header.number,
            }
            .into());
        }
    }
    validator.validate_header_chain(None, headers)?;
    Ok(())
}

impl FeedKind for HeadersKind {
    type Target = HeaderTarget;
    type Task = BlockRange;
    type Request = BlockRange;
    type Response = Vec<BlockHeader>;
    type Valid = Vec<BlockHeader>;

    const ORDERED: bool = true;

    fn data_kind(&self) -> DataKind {
        DataKind::Headers
    }

    fn plan(&self, target: &HeaderTarget) -> Plan<BlockRange> {
        self.held.lock().clear();

        let range = target.range;
        let (above, below) = match self.stored() {
            Some(stored) => (
                BlockRange::new(stored.end.max(range.start), range.end),
                BlockRange::new(range.start, stored.start.min(range.end)),
            ),
            None => (BlockRange::default(), range),
        };

        let mut tasks = above.split_from_top(self.batch_size);
        tasks.extend(below.split_from_top(self.batch_size));
        Plan {
            tasks,
            start: range.start,
            total: range.len(),
            done: range.len() - above.len() - below.len(),
        }
    }

    fn task_items(task: &BlockRange) -> u64 {
        task.len()
    }

    fn allocation(&self, _target: &HeaderTarget, task: &BlockRange) -> AllocationRequest {
        AllocationRequest::new(AllocationStrategy::BestHead).with_min_head(task.end - 1)
    }

    fn prepare(&self, _target: &HeaderTarget, task: &BlockRange) -> Option<BlockRange> {
        Some(*task)
    }

    fn fetch(
        transport: Arc<dyn SyncTransport>,
        peer: PeerId,
        request: BlockRange,
    ) -> BoxFuture<'static, Result<Vec<BlockHeader>, TransportError>> {
        async move {
            transport
                .request_headers(peer, request.start, request.len())
                .await
        }
        .boxed()
    }

    fn validate(
        &self,
        target: &HeaderTarget,
        task: &BlockRange,
        _request: &BlockRange,
        headers: Vec<BlockHeader>,
    ) -> Result<Checked<BlockRange, Vec<BlockHeader>>, PeerFault> {
        check_header_batch(self.validator.as_ref(), *task, &headers)?;

        if task.end == target.range.end {
            if let (Some(expected), Some(last)) = (target.last_hash, headers.last()) {
                if last.hash() != expected {
                    return Err(ValidationError::AnchorMismatch.into());
                }
            }
        }

        Ok(Checked::complete(headers))
    }

    fn commit(
        &self,
        target: &HeaderTarget,
        task: &BlockRange,
        headers: Vec<BlockHeader>,
    ) -> Result<Committed<BlockRange>, CommitError> {
        let anchor = self.anchor_above(target, task)?;
        if let (Some(expected), Some(last)) = (anchor, headers.last()) {
            if last.hash() != expected {
                return Err(PeerFault::from(ValidationError::AnchorMismatch).into());
            }
        }

        let count = headers.len() as u64;
        match self.store.next_missing(DataKind::Headers) {
            Some(top) if task.start >= top => {
                let run = {
                    let mut held = self.held.lock();
                    let mut run = headers;
                    run.append(&mut held);
                    if task.start != top {
                        *held = run;
                        return Ok(Committed::done(count));
                    }
                    run
                };
                self.store
                    .append_contiguous(top, ChainItems::Headers(run))?;
            }
            _ => {
                self.store
                    .prepend_contiguous(task.end, ChainItems::Headers(headers))?;
            }
        }
        Ok(Committed::done(count))
    }
}

/// Whether every header of `range` is stored and linked up to its end.
pub fn headers_complete(store: &dyn ChainStore, range: BlockRange) -> bool {
    range.is_empty()
        || (store
            .lowest_stored(DataKind::Headers)
            .is_some_and(|lowest| lowest <= range.start)
            && store
                .next_missing(DataKind::Headers)
                .is_some_and(|top| top >= range.end))
}
