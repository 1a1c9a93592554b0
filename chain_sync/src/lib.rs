pub mod sim;
pub mod sync;
pub mod types;

pub use libp2p_identity::PeerId;
