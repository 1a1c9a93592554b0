use crate::{BlockHeader, BlockNumber, Bytes32};
use serde::{Deserialize, Serialize};

/// Chain head advertised by a peer during handshake or block announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainHead {
    pub number: BlockNumber,
    pub hash: Bytes32,
    pub total_difficulty: u128,
}

impl ChainHead {
    pub fn new(number: BlockNumber, hash: Bytes32, total_difficulty: u128) -> Self {
        Self {
            number,
            hash,
            total_difficulty,
        }
    }

    pub fn from_header(header: &BlockHeader, total_difficulty: u128) -> Self {
        Self::new(header.number, header.hash(), total_difficulty)
    }
}
