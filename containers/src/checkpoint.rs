use crate::{BlockHeader, BlockNumber, Bytes32};
use serde::{Deserialize, Serialize};

/// Represents a checkpoint in the chain's history.
///
/// A checkpoint names one block by number and hash. Sync uses it as the
/// fast-sync pivot: the trusted anchor below which data is accepted without
/// re-executing the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The number of the checkpoint's block.
    pub number: BlockNumber,
    /// The hash of the checkpoint's block.
    pub hash: Bytes32,
}

impl Checkpoint {
    pub fn new(number: BlockNumber, hash: Bytes32) -> Self {
        Self { number, hash }
    }

    /// Return a checkpoint at block 0 with a zero hash.
    pub fn genesis() -> Self {
        Self {
            number: 0,
            hash: Bytes32::ZERO,
        }
    }

    pub fn of(header: &BlockHeader) -> Self {
        Self {
            number: header.number,
            hash: header.hash(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_checkpoint() {
        let checkpoint = Checkpoint::genesis();
        assert_eq!(checkpoint.hash, Bytes32::ZERO);
        assert_eq!(checkpoint.number, 0);
    }

    #[test]
    fn test_checkpoint_of_header() {
        let header = BlockHeader {
            number: 42,
            ..Default::default()
        };
        let checkpoint = Checkpoint::of(&header);
        assert_eq!(checkpoint, Checkpoint::new(42, header.hash()));
    }
}
