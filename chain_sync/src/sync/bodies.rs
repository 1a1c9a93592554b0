use std::sync::Arc;

use containers::{BlockBody, BlockHeader};
use futures::{FutureExt, future::BoxFuture};
use libp2p_identity::PeerId;

use super::{
    error::{PeerFault, TransportError},
    feed::{BlockRange, Checked, CommitError, Committed, FeedKind, Plan, plan_range},
    peer_pool::{AllocationRequest, AllocationStrategy},
};
use crate::types::{BlockValidator, ChainItems, ChainStore, DataKind, SyncTransport};

/// Headers of every block in `range`, or `None` if any is not stored yet.
pub(crate) fn stored_headers(store: &dyn ChainStore, range: BlockRange) -> Option<Vec<BlockHeader>> {
    (range.start..range.end)
        .map(|number| store.header(number))
        .collect()
}

/// Downloads ancient block bodies between the bodies barrier and the pivot.
///
/// A batch goes out only once its headers are stored, since bodies are
/// requested by header hash and checked against the header's roots.
pub struct BodiesKind {
    store: Arc<dyn ChainStore>,
    validator: Arc<dyn BlockValidator>,
    batch_size: u64,
}

impl BodiesKind {
    pub fn new(
        store: Arc<dyn ChainStore>,
        validator: Arc<dyn BlockValidator>,
        batch_size: u64,
    ) -> Self {
        Self {
            store,
            validator,
            batch_size,
        }
    }
}

impl FeedKind for BodiesKind {
    type Target = BlockRange;
    type Task = BlockRange;
    type Request = Vec<BlockHeader>;
    type Response = Vec<BlockBody>;
    type Valid = Vec<BlockBody>;

    const ORDERED: bool = true;

    fn data_kind(&self) -> DataKind {
        DataKind::Bodies
    }

    fn plan(&self, target: &BlockRange) -> Plan<BlockRange> {
        plan_range(self.store.as_ref(), DataKind::Bodies, *target, self.batch_size)
    }

    fn task_items(task: &BlockRange) -> u64 {
        task.len()
    }

    fn allocation(&self, _target: &BlockRange, task: &BlockRange) -> AllocationRequest {
        AllocationRequest::new(AllocationStrategy::LeastRecentlyUsed).with_min_head(task.end - 1)
    }

    fn prepare(&self, _target: &BlockRange, task: &BlockRange) -> Option<Vec<BlockHeader>> {
        stored_headers(self.store.as_ref(), *task)
    }

    fn fetch(
        transport: Arc<dyn SyncTransport>,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> BoxFuture<'static, Result<Vec<BlockBody>, TransportError>> {
        async move {
            let hashes = headers.iter().map(BlockHeader::hash).collect();
            transport.request_bodies(peer, hashes).await
        }
        .boxed()
    }

    fn validate(
        &self,
        _target: &BlockRange,
        _task: &BlockRange,
        headers: &Vec<BlockHeader>,
        bodies: Vec<BlockBody>,
    ) -> Result<Checked<BlockRange, Vec<BlockBody>>, PeerFault> {
        if bodies.is_empty() {
            return Err(PeerFault::Empty);
        }
        if bodies.len() != headers.len() {
            return Err(PeerFault::WrongCount {
                expected: headers.len(),
                actual: bodies.len(),
            });
        }
        for (header, body) in headers.iter().zip(&bodies) {
            self.validator.validate_body(header, body)?;
        }
        Ok(Checked::complete(bodies))
    }

    fn commit(
        &self,
        _target: &BlockRange,
        task: &BlockRange,
        bodies: Vec<BlockBody>,
    ) -> Result<Committed<BlockRange>, CommitError> {
        let count = bodies.len() as u64;
        self.store
            .append_contiguous(task.start, ChainItems::Bodies(bodies))?;
        Ok(Committed::done(count))
    }
}
