use crate::{BlockNumber, Bytes32, ordered_root, sha256};
use serde::{Deserialize, Serialize};

/// Header of a block, committing to its body, receipts and post-state.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: BlockNumber,
    pub parent_hash: Bytes32,
    pub state_root: Bytes32,
    pub transactions_root: Bytes32,
    pub receipts_root: Bytes32,
    pub difficulty: u128,
    pub timestamp: u64,
    #[serde(default)]
    pub extra_data: Vec<u8>,
}

impl BlockHeader {
    /// Hash identifying this header.
    pub fn hash(&self) -> Bytes32 {
        let number = self.number.to_be_bytes();
        let difficulty = self.difficulty.to_be_bytes();
        let timestamp = self.timestamp.to_be_bytes();
        sha256(&[
            number.as_slice(),
            self.parent_hash.as_bytes(),
            self.state_root.as_bytes(),
            self.transactions_root.as_bytes(),
            self.receipts_root.as_bytes(),
            difficulty.as_slice(),
            timestamp.as_slice(),
            self.extra_data.as_slice(),
        ])
    }

    /// Whether `self` directly extends `parent`.
    pub fn is_child_of(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash()
    }
}

/// The body of a block, containing the opaque transaction payloads.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn new(transactions: Vec<Vec<u8>>) -> Self {
        Self { transactions }
    }

    pub fn transactions_root(&self) -> Bytes32 {
        ordered_root(self.transactions.iter().map(|tx| sha256(&[tx.as_slice()])))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }
}
