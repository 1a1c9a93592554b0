use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Active synchronization phases.
    ///
    /// Several fast-sync phases can be active together; `DISCONNECTED` is
    /// never combined with anything else and the empty set (`NONE`) is the
    /// only mode with no feed running.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SyncMode: u16 {
        /// Caught up; waiting for the network to produce a new block.
        const WAITING_FOR_BLOCK = 1 << 0;
        /// Following the live chain block by block.
        const FULL = 1 << 1;
        /// Fast sync warranted, pivot not resolved yet.
        const FAST_SYNC = 1 << 2;
        const FAST_HEADERS = 1 << 3;
        const FAST_BODIES = 1 << 4;
        const FAST_RECEIPTS = 1 << 5;
        const STATE_NODES = 1 << 6;
        const DISCONNECTED = 1 << 7;
    }
}

impl SyncMode {
    pub const NONE: SyncMode = SyncMode::empty();

    /// The historical download phases, which always run together.
    pub const FAST_BLOCKS: SyncMode = SyncMode::FAST_HEADERS
        .union(SyncMode::FAST_BODIES)
        .union(SyncMode::FAST_RECEIPTS);

    const NAMES: [(SyncMode, &'static str); 8] = [
        (SyncMode::WAITING_FOR_BLOCK, "WaitingForBlock"),
        (SyncMode::FULL, "Full"),
        (SyncMode::FAST_SYNC, "FastSync"),
        (SyncMode::FAST_HEADERS, "FastHeaders"),
        (SyncMode::FAST_BODIES, "FastBodies"),
        (SyncMode::FAST_RECEIPTS, "FastReceipts"),
        (SyncMode::STATE_NODES, "StateNodes"),
        (SyncMode::DISCONNECTED, "Disconnected"),
    ];

    /// Whether this combination of flags may be active at once.
    pub fn is_consistent(&self) -> bool {
        !self.contains(SyncMode::DISCONNECTED) || *self == SyncMode::DISCONNECTED
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::NONE
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SyncMode::NONE.to_string(), "None");
        assert_eq!(
            SyncMode::FAST_BLOCKS.to_string(),
            "FastHeaders|FastBodies|FastReceipts"
        );
        assert_eq!(SyncMode::DISCONNECTED.to_string(), "Disconnected");
    }

    #[test]
    fn test_disconnected_is_exclusive() {
        assert!(SyncMode::DISCONNECTED.is_consistent());
        assert!(SyncMode::FAST_BLOCKS.is_consistent());
        assert!(!(SyncMode::DISCONNECTED | SyncMode::FULL).is_consistent());
    }
}
