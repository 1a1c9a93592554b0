/// In-memory persistence layer.
///
/// Keeps one contiguous segment per data class. An empty segment accepts
/// a write at any height (that is where a barrier or the pivot puts it);
/// after that, appends must continue exactly where the segment ends and
/// prepends must end exactly where it starts.
///
/// Genesis is kept aside until the header segment grows down to it.
use std::collections::HashMap;

use containers::{Block, BlockBody, BlockHeader, BlockNumber, Bytes32, Receipt, StateNode};
use parking_lot::RwLock;
use tracing::debug;

use super::{error::GapError, feed::BlockRange};
use crate::types::{ChainItems, ChainStore, DataKind};

#[derive(Debug)]
struct Segment<T> {
    start: Option<BlockNumber>,
    items: Vec<T>,
}

impl<T> Default for Segment<T> {
    fn default() -> Self {
        Self {
            start: None,
            items: Vec::new(),
        }
    }
}

impl<T> Segment<T> {
    fn anchored(start: BlockNumber) -> Self {
        Self {
            start: Some(start),
            items: Vec::new(),
        }
    }

    fn next(&self) -> Option<BlockNumber> {
        self.start.map(|start| start + self.items.len() as u64)
    }

    fn range(&self) -> Option<BlockRange> {
        Some(BlockRange::new(self.start?, self.next()?))
    }

    fn get(&self, number: BlockNumber) -> Option<&T> {
        let offset = number.checked_sub(self.start?)?;
        self.items.get(usize::try_from(offset).ok()?)
    }

    fn first(&self) -> Option<BlockNumber> {
        self.start
    }

    fn prepend(&mut self, kind: DataKind, end: BlockNumber, mut items: Vec<T>) -> Result<(), GapError> {
        let count = items.len() as u64;
        let Some(start) = end.checked_sub(count) else {
            return Err(GapError {
                kind,
                start: 0,
                expected: self.start.and_then(|first| first.checked_sub(count)),
            });
        };
        match self.start {
            Some(first) if first != end => Err(GapError {
                kind,
                start,
                expected: first.checked_sub(count),
            }),
            _ => {
                items.append(&mut self.items);
                self.items = items;
                self.start = Some(start);
                Ok(())
            }
        }
    }

    fn append(&mut self, kind: DataKind, start: BlockNumber, items: Vec<T>) -> Result<(), GapError> {
        match self.next() {
            Some(next) if next != start => Err(GapError {
                kind,
                start,
                expected: Some(next),
            }),
            Some(_) => {
                self.items.extend(items);
                Ok(())
            }
            None => {
                self.start = Some(start);
                self.items = items;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    headers: Segment<BlockHeader>,
    bodies: Segment<BlockBody>,
    receipts: Segment<Vec<Receipt>>,
    blocks: Segment<Block>,
    state: HashMap<Bytes32, StateNode>,
    genesis: Option<BlockHeader>,
    best_full: Option<BlockHeader>,
    appends: Vec<(DataKind, BlockNumber, usize)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding only the genesis header, which is also the best full
    /// block.
    pub fn with_genesis(genesis: BlockHeader) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            inner.genesis = Some(genesis.clone());
            inner.blocks = Segment::anchored(genesis.number + 1);
            inner.best_full = Some(genesis);
        }
        store
    }

    /// Stored range for `kind`.
    pub fn stored_range(&self, kind: DataKind) -> Option<BlockRange> {
        let inner = self.inner.read();
        match kind {
            DataKind::Headers => inner.headers.range(),
            DataKind::Bodies => inner.bodies.range(),
            DataKind::Receipts => inner.receipts.range(),
            DataKind::Blocks => inner.blocks.range(),
            DataKind::StateNodes => None,
        }
    }

    pub fn body(&self, number: BlockNumber) -> Option<BlockBody> {
        let inner = self.inner.read();
        inner
            .bodies
            .get(number)
            .or_else(|| inner.blocks.get(number).map(|block| &block.body))
            .cloned()
    }

    pub fn receipts(&self, number: BlockNumber) -> Option<Vec<Receipt>> {
        self.inner.read().receipts.get(number).cloned()
    }

    pub fn state_node_count(&self) -> usize {
        self.inner.read().state.len()
    }

    /// Every accepted append as `(kind, start, count)`, in order.
    pub fn appends(&self) -> Vec<(DataKind, BlockNumber, usize)> {
        self.inner.read().appends.clone()
    }
}

impl ChainStore for MemoryStore {
    fn append_contiguous(&self, start: BlockNumber, items: ChainItems) -> Result<(), GapError> {
        let kind = items.kind();
        let count = items.len();
        let mut inner = self.inner.write();

        match items {
            ChainItems::Headers(headers) => inner.headers.append(kind, start, headers)?,
            ChainItems::Bodies(bodies) => inner.bodies.append(kind, start, bodies)?,
            ChainItems::Receipts(receipts) => inner.receipts.append(kind, start, receipts)?,
            ChainItems::Blocks(blocks) => {
                let best = blocks.last().map(|block| block.header.clone());
                inner.blocks.append(kind, start, blocks)?;
                if best.is_some() {
                    inner.best_full = best;
                }
            }
        }

        debug!(%kind, start, count, "Persisted items");
        inner.appends.push((kind, start, count));
        Ok(())
    }

    fn prepend_contiguous(&self, end: BlockNumber, items: ChainItems) -> Result<(), GapError> {
        let kind = items.kind();
        let count = items.len();
        let mut inner = self.inner.write();
        let start = end.saturating_sub(count as u64);

        match items {
            ChainItems::Headers(headers) => {
                inner.headers.prepend(kind, end, headers)?;
                let genesis = inner
                    .genesis
                    .clone()
                    .filter(|genesis| inner.headers.first() == Some(genesis.number + 1));
                if let Some(genesis) = genesis {
                    inner.headers.prepend(kind, genesis.number + 1, vec![genesis])?;
                }
            }
            ChainItems::Bodies(bodies) => inner.bodies.prepend(kind, end, bodies)?,
            ChainItems::Receipts(receipts) => inner.receipts.prepend(kind, end, receipts)?,
            ChainItems::Blocks(_) => {
                return Err(GapError {
                    kind,
                    start,
                    expected: inner.blocks.next(),
                });
            }
        }

        debug!(%kind, start, count, "Persisted items below stored range");
        inner.appends.push((kind, start, count));
        Ok(())
    }

    fn lowest_stored(&self, kind: DataKind) -> Option<BlockNumber> {
        let inner = self.inner.read();
        match kind {
            DataKind::Headers => inner.headers.first(),
            DataKind::Bodies => inner.bodies.first(),
            DataKind::Receipts => inner.receipts.first(),
            DataKind::Blocks => inner.blocks.range().map(|range| range.start),
            DataKind::StateNodes => None,
        }
    }

    fn next_missing(&self, kind: DataKind) -> Option<BlockNumber> {
        let inner = self.inner.read();
        match kind {
            DataKind::Headers => inner.headers.next(),
            DataKind::Bodies => inner.bodies.next(),
            DataKind::Receipts => inner.receipts.next(),
            DataKind::Blocks => inner.blocks.next(),
            DataKind::StateNodes => None,
        }
    }

    fn header(&self, number: BlockNumber) -> Option<BlockHeader> {
        let inner = self.inner.read();
        inner
            .headers
            .get(number)
            .cloned()
            .or_else(|| inner.blocks.get(number).map(|block| block.header.clone()))
            .or_else(|| {
                inner
                    .genesis
                    .as_ref()
                    .filter(|genesis| genesis.number == number)
                    .cloned()
            })
            .or_else(|| {
                inner
                    .best_full
                    .as_ref()
                    .filter(|best| best.number == number)
                    .cloned()
            })
    }

    fn state_node(&self, hash: &Bytes32) -> Option<StateNode> {
        self.inner.read().state.get(hash).cloned()
    }

    fn has_state_node(&self, hash: &Bytes32) -> bool {
        self.inner.read().state.contains_key(hash)
    }

    fn insert_state_nodes(&self, nodes: Vec<StateNode>) {
        let mut inner = self.inner.write();
        for node in nodes {
            inner.state.insert(node.hash(), node);
        }
    }

    fn best_full_block(&self) -> Option<BlockHeader> {
        self.inner.read().best_full.clone()
    }

    fn set_best_full_block(&self, header: BlockHeader) {
        let mut inner = self.inner.write();
        debug!(number = header.number, "Best full block re-anchored");
        inner.blocks = Segment::anchored(header.number + 1);
        inner.best_full = Some(header);
    }
}
