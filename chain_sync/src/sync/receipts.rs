use std::sync::Arc;

use containers::{BlockHeader, Receipt};
use futures::{FutureExt, future::BoxFuture};
use libp2p_identity::PeerId;

use super::{
    bodies::stored_headers,
    error::{PeerFault, TransportError},
    feed::{BlockRange, Checked, CommitError, Committed, FeedKind, Plan, plan_range},
    peer_pool::{AllocationRequest, AllocationStrategy},
};
use crate::types::{BlockValidator, ChainItems, ChainStore, DataKind, SyncTransport};

/// Downloads ancient receipts between the receipts barrier and the pivot.
pub struct ReceiptsKind {
    store: Arc<dyn ChainStore>,
    validator: Arc<dyn BlockValidator>,
    batch_size: u64,
}

impl ReceiptsKind {
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

impl FeedKind for ReceiptsKind {
    type Target = BlockRange;
    type Task = BlockRange;
    type Request = Vec<BlockHeader>;
    type Response = Vec<Vec<Receipt>>;
    type Valid = Vec<Vec<Receipt>>;

    const ORDERED: bool = true;

    fn data_kind(&self) -> DataKind {
        DataKind::Receipts
    }

    fn plan(&self, target: &BlockRange) -> Plan<BlockRange> {
        plan_range(self.store.as_ref(), DataKind::Receipts, *target, self.batch_size)
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
    ) -> BoxFuture<'static, Result<Vec<Vec<Receipt>>, TransportError>> {
        async move {
            let hashes = headers.iter().map(BlockHeader::hash).collect();
            transport.request_receipts(peer, hashes).await
        }
        .boxed()
    }

    fn validate(
        &self,
        _target: &BlockRange,
        _task: &BlockRange,
        headers: &Vec<BlockHeader>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<Checked<BlockRange, Vec<Vec<Receipt>>>, PeerFault> {
        if receipts.is_empty() {
            return Err(PeerFault::Empty);
        }
        if receipts.len() != headers.len() {
            return Err(PeerFault::WrongCount {
                expected: headers.len(),
                actual: receipts.len(),
            });
        }
        for (header, block_receipts) in headers.iter().zip(&receipts) {
            self.validator.validate_receipts(header, block_receipts)?;
        }
        Ok(Checked::complete(receipts))
    }

    fn commit(
        &self,
        _target: &BlockRange,
        task: &BlockRange,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<Committed<BlockRange>, CommitError> {
        let count = receipts.len() as u64;
        self.store
            .append_contiguous(task.start, ChainItems::Receipts(receipts))?;
        Ok(Committed::done(count))
    }
}
