use std::fmt::{self, Display};

use async_trait::async_trait;
use containers::{
    Block, BlockBody, BlockHeader, BlockNumber, Bytes32, ChainHead, Receipt, StateNode,
};
use libp2p_identity::PeerId;
use serde::Serialize;

use crate::sync::error::{GapError, TransportError, ValidationError};

/// Class of chain data a feed downloads and the persistence layer stores.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Headers,
    Bodies,
    Receipts,
    StateNodes,
    /// Fully executed blocks above the pivot.
    Blocks,
}

impl DataKind {
    pub const ALL: [DataKind; 5] = [
        DataKind::Headers,
        DataKind::Bodies,
        DataKind::Receipts,
        DataKind::StateNodes,
        DataKind::Blocks,
    ];

    /// Label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Headers => "headers",
            DataKind::Bodies => "bodies",
            DataKind::Receipts => "receipts",
            DataKind::StateNodes => "state_nodes",
            DataKind::Blocks => "blocks",
        }
    }

    /// Label used in progress lines.
    pub fn phase_name(&self) -> &'static str {
        match self {
            DataKind::Headers => "Old Headers",
            DataKind::Bodies => "Old Bodies",
            DataKind::Receipts => "Old Receipts",
            DataKind::StateNodes => "State Nodes",
            DataKind::Blocks => "Full Blocks",
        }
    }
}

impl Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous run of items handed to the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainItems {
    Headers(Vec<BlockHeader>),
    Bodies(Vec<BlockBody>),
    Receipts(Vec<Vec<Receipt>>),
    Blocks(Vec<Block>),
}

impl ChainItems {
    pub fn kind(&self) -> DataKind {
        match self {
            ChainItems::Headers(_) => DataKind::Headers,
            ChainItems::Bodies(_) => DataKind::Bodies,
            ChainItems::Receipts(_) => DataKind::Receipts,
            ChainItems::Blocks(_) => DataKind::Blocks,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChainItems::Headers(items) => items.len(),
            ChainItems::Bodies(items) => items.len(),
            ChainItems::Receipts(items) => items.len(),
            ChainItems::Blocks(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events consumed by the sync service's event loop.
///
/// Every event triggers a re-evaluation of the sync mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Transport established a session with a peer.
    PeerConnected(PeerId),
    /// Peer completed the handshake or announced a new head.
    PeerHead(PeerId, ChainHead),
    /// Transport lost the peer.
    PeerDisconnected(PeerId),
    /// A feed drained its active range.
    FeedFinished(DataKind),
    /// Pivot header fetched from the network.
    PivotResolved(BlockHeader),
    /// Pivot resolution failed and may be retried.
    PivotFailed(String),
    Shutdown,
}

impl Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::PeerConnected(peer) => write!(f, "PeerConnected({peer})"),
            SyncEvent::PeerHead(peer, head) => write!(f, "PeerHead({peer}, {})", head.number),
            SyncEvent::PeerDisconnected(peer) => write!(f, "PeerDisconnected({peer})"),
            SyncEvent::FeedFinished(kind) => write!(f, "FeedFinished({kind})"),
            SyncEvent::PivotResolved(header) => write!(f, "PivotResolved({})", header.number),
            SyncEvent::PivotFailed(reason) => write!(f, "PivotFailed({reason})"),
            SyncEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Per-peer request/response primitives offered by the wire transport.
///
/// Timeouts are applied by the caller.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn request_headers(
        &self,
        peer: PeerId,
        from: BlockNumber,
        count: u64,
    ) -> Result<Vec<BlockHeader>, TransportError>;

    async fn request_bodies(
        &self,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Vec<BlockBody>, TransportError>;

    async fn request_receipts(
        &self,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Vec<Vec<Receipt>>, TransportError>;

    async fn request_state_nodes(
        &self,
        peer: PeerId,
        hashes: Vec<Bytes32>,
    ) -> Result<Vec<StateNode>, TransportError>;

    /// Drop the session with a peer the pool has banned.
    fn disconnect(&self, _peer: PeerId) {}
}

/// Consensus-side checks the sync core delegates to.
pub trait BlockValidator: Send + Sync {
    /// Headers must be consecutive and hash-linked, and the first must
    /// extend `parent` when one is given.
    fn validate_header_chain(
        &self,
        parent: Option<&BlockHeader>,
        headers: &[BlockHeader],
    ) -> Result<(), ValidationError>;

    fn validate_body(&self, header: &BlockHeader, body: &BlockBody)
    -> Result<(), ValidationError>;

    fn validate_receipts(
        &self,
        header: &BlockHeader,
        receipts: &[Receipt],
    ) -> Result<(), ValidationError>;

    fn execute_block(&self, block: &Block) -> Result<(), ValidationError>;
}

/// Persistence layer the feeds write confirmed data into.
pub trait ChainStore: Send + Sync {
    /// Append `items` starting at block `start`. Rejects anything that does
    /// not continue the stored range of that kind.
    fn append_contiguous(&self, start: BlockNumber, items: ChainItems) -> Result<(), GapError>;

    /// Insert `items` ending just below block `end`. Rejects anything that
    /// does not end where the stored range of that kind starts.
    fn prepend_contiguous(&self, end: BlockNumber, items: ChainItems) -> Result<(), GapError>;

    /// Lowest block number stored for `kind`.
    fn lowest_stored(&self, kind: DataKind) -> Option<BlockNumber>;

    /// First block number not yet stored for `kind`, `None` when nothing
    /// of that kind has been stored.
    fn next_missing(&self, kind: DataKind) -> Option<BlockNumber>;

    fn header(&self, number: BlockNumber) -> Option<BlockHeader>;

    fn state_node(&self, hash: &Bytes32) -> Option<StateNode>;

    fn has_state_node(&self, hash: &Bytes32) -> bool {
        self.state_node(hash).is_some()
    }

    fn insert_state_nodes(&self, nodes: Vec<StateNode>);

    /// Head of the fully validated chain.
    fn best_full_block(&self) -> Option<BlockHeader>;

    /// Move the full-chain head to `header` once its state is available,
    /// e.g. the pivot after state sync.
    fn set_best_full_block(&self, header: BlockHeader);
}
