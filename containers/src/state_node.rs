use crate::{Bytes32, sha256};
use serde::{Deserialize, Serialize};

/// A node of the state trie as seen by sync.
///
/// The payload is opaque; `children` are the references that must be
/// fetched for the subtree below this node to be complete. The node hash
/// commits to both.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateNode {
    pub data: Vec<u8>,
    #[serde(default)]
    pub children: Vec<Bytes32>,
}

impl StateNode {
    pub fn leaf(data: Vec<u8>) -> Self {
        Self {
            data,
            children: Vec::new(),
        }
    }

    pub fn branch(data: Vec<u8>, children: Vec<Bytes32>) -> Self {
        Self { data, children }
    }

    pub fn hash(&self) -> Bytes32 {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(self.children.len() + 1);
        parts.push(&self.data);
        parts.extend(self.children.iter().map(Bytes32::as_bytes));
        sha256(&parts)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
