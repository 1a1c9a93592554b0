/// Chain synchronization engine.
///
/// Downloads and validates chain data from untrusted peers until the local
/// node can follow the network head. It includes:
///
/// - **Peer Pool**: Tracks peer heads, scores and exclusive allocation
/// - **Feeds**: One generic download engine per data class (headers,
///   bodies, receipts, state nodes, full blocks)
/// - **Pivot**: The fast-sync trust anchor and the ancient barriers below it
/// - **Selector**: Maps local and peer state to the set of active phases
/// - **Report**: Periodic progress lines and gauges
/// - **Sync Service**: Coordinates all of the above
///
/// ## Architecture
///
/// The service reacts to events:
/// 1. Transport reports peer connections and head announcements
/// 2. The selector recomputes the sync mode from local and peer state
/// 3. Each feed is activated, retargeted or stopped to match the mode
/// 4. Feeds pull work, allocate peers, validate and persist contiguously
/// 5. Finished feeds report back, which re-runs the selector
///
/// ## Modes
///
/// - **FastSync**: Resolving the pivot header
/// - **FastHeaders / FastBodies / FastReceipts**: Historical data below the pivot
/// - **StateNodes**: The pivot's state tree
/// - **Full**: Executing blocks above the best full block
/// - **WaitingForBlock**: Caught up with every peer
pub mod backoff;
pub mod batch_buffer;
pub mod bodies;
pub mod config;
pub mod error;
pub mod feed;
pub mod head_sync;
pub mod headers;
pub mod mode;
pub mod peer_pool;
pub mod pivot;
pub mod progress;
pub mod receipts;
pub mod report;
pub mod selector;
pub mod service;
pub mod state_nodes;
pub mod states;
pub mod store;
pub mod validation;

pub use config::*;
pub use error::{ConfigError, GapError, PeerFault, SyncError, TransportError, ValidationError};
pub use feed::{BlockRange, Feed, FeedHandle, FeedKind};
pub use mode::SyncMode;
pub use peer_pool::{AllocationRequest, AllocationStrategy, PeerOutcome, SyncPeer, SyncPeerPool};
pub use pivot::{Pivot, PivotTracker};
pub use progress::{FeedProgress, ProgressSnapshot};
pub use report::{FeedSample, LogSink, ReportSink, SyncReport};
pub use selector::{LocalChainState, PeerState, select_mode};
pub use service::SyncService;
pub use states::FeedState;
pub use store::MemoryStore;
pub use validation::StructuralValidator;

#[cfg(test)]
mod tests;
