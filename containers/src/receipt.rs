use crate::{Bytes32, ordered_root, sha256};
use serde::{Deserialize, Serialize};

/// Outcome of executing one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    #[serde(default)]
    pub logs: Vec<Vec<u8>>,
}

impl Receipt {
    pub fn hash(&self) -> Bytes32 {
        let logs_root = ordered_root(self.logs.iter().map(|log| sha256(&[log.as_slice()])));
        let status = [self.success as u8];
        let gas = self.cumulative_gas_used.to_be_bytes();
        sha256(&[status.as_slice(), gas.as_slice(), logs_root.as_bytes()])
    }
}

/// Root committed to by `BlockHeader::receipts_root`.
pub fn receipts_root(receipts: &[Receipt]) -> Bytes32 {
    ordered_root(receipts.iter().map(Receipt::hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_changes_with_status() {
        let ok = Receipt {
            success: true,
            cumulative_gas_used: 21_000,
            logs: vec![],
        };
        let failed = Receipt {
            success: false,
            ..ok.clone()
        };
        assert_ne!(receipts_root(&[ok.clone()]), receipts_root(&[failed]));
        assert_ne!(receipts_root(&[ok]), receipts_root(&[]));
    }
}
