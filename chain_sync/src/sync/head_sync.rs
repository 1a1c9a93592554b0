/// Live-chain follower.
///
/// Above the pivot every block is fully validated and executed before it
/// extends the local chain. Blocks are fetched in small batches (headers,
/// then bodies from the same peer), checked, and committed strictly in
/// order on top of the current best full block.
use std::sync::Arc;

use containers::{Block, BlockBody, BlockHeader};
use futures::{FutureExt, future::BoxFuture};
use libp2p_identity::PeerId;
use tracing::debug;

use super::{
    error::{GapError, PeerFault, TransportError},
    feed::{BlockRange, Checked, CommitError, Committed, FeedKind, Plan},
    headers::check_header_batch,
    peer_pool::{AllocationRequest, AllocationStrategy},
};
use crate::types::{BlockValidator, ChainItems, ChainStore, DataKind, SyncTransport};

pub struct FullBlocksKind {
    store: Arc<dyn ChainStore>,
    validator: Arc<dyn BlockValidator>,
    batch_size: u64,
}

impl FullBlocksKind {
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

impl FeedKind for FullBlocksKind {
    /// `[best full block + 1, network head + 1)`.
    type Target = BlockRange;
    type Task = BlockRange;
    type Request = BlockRange;
    type Response = (Vec<BlockHeader>, Vec<BlockBody>);
    type Valid = Vec<Block>;

    const ORDERED: bool = true;

    fn data_kind(&self) -> DataKind {
        DataKind::Blocks
    }

    fn plan(&self, target: &BlockRange) -> Plan<BlockRange> {
        let resume = self
            .store
            .best_full_block()
            .map_or(target.start, |best| (best.number + 1).clamp(target.start, target.end));
        Plan {
            tasks: BlockRange::new(resume, target.end).split(self.batch_size),
            start: target.start,
            total: target.len(),
            done: resume - target.start,
        }
    }

    fn task_items(task: &BlockRange) -> u64 {
        task.len()
    }

    fn allocation(&self, _target: &BlockRange, task: &BlockRange) -> AllocationRequest {
        AllocationRequest::new(AllocationStrategy::BestHead).with_min_head(task.end - 1)
    }

    fn prepare(&self, _target: &BlockRange, task: &BlockRange) -> Option<BlockRange> {
        Some(*task)
    }

    fn fetch(
        transport: Arc<dyn SyncTransport>,
        peer: PeerId,
        range: BlockRange,
    ) -> BoxFuture<'static, Result<(Vec<BlockHeader>, Vec<BlockBody>), TransportError>> {
        async move {
            let headers = transport
                .request_headers(peer, range.start, range.len())
                .await?;
            let hashes = headers.iter().map(BlockHeader::hash).collect();
            let bodies = transport.request_bodies(peer, hashes).await?;
            Ok((headers, bodies))
        }
        .boxed()
    }

    fn validate(
        &self,
        _target: &BlockRange,
        task: &BlockRange,
        _request: &BlockRange,
        (headers, bodies): (Vec<BlockHeader>, Vec<BlockBody>),
    ) -> Result<Checked<BlockRange, Vec<Block>>, PeerFault> {
        check_header_batch(self.validator.as_ref(), *task, &headers)?;
        if bodies.len() != headers.len() {
            return Err(PeerFault::WrongCount {
                expected: headers.len(),
                actual: bodies.len(),
            });
        }
        for (header, body) in headers.iter().zip(&bodies) {
            self.validator.validate_body(header, body)?;
        }

        let blocks = headers
            .into_iter()
            .zip(bodies)
            .map(|(header, body)| Block::new(header, body))
            .collect();
        Ok(Checked::complete(blocks))
    }

    fn commit(
        &self,
        _target: &BlockRange,
        task: &BlockRange,
        blocks: Vec<Block>,
    ) -> Result<Committed<BlockRange>, CommitError> {
        let parent = self.store.best_full_block();
        let expected = parent.as_ref().map_or(0, |parent| parent.number + 1);
        if expected != task.start {
            return Err(GapError {
                kind: DataKind::Blocks,
                start: task.start,
                expected: Some(expected),
            }
            .into());
        }

        let headers: Vec<BlockHeader> = blocks.iter().map(|block| block.header.clone()).collect();
        self.validator
            .validate_header_chain(parent.as_ref(), &headers[..1])
            .map_err(PeerFault::from)?;
        for block in &blocks {
            self.validator
                .execute_block(block)
                .map_err(PeerFault::from)?;
        }

        let count = blocks.len() as u64;
        debug!(
            from = task.start,
            to = task.end - 1,
            "Executed blocks"
        );
        self.store
            .append_contiguous(task.start, ChainItems::Blocks(blocks))?;
        Ok(Committed::done(count))
    }
}
