pub mod block;
pub mod checkpoint;
pub mod receipt;
pub mod state_node;
pub mod status;
pub mod types;

pub use block::{Block, BlockBody, BlockHeader};
pub use checkpoint::Checkpoint;
pub use receipt::{Receipt, receipts_root};
pub use state_node::StateNode;
pub use status::ChainHead;
pub use types::{BlockNumber, Bytes32, ordered_root, sha256};
