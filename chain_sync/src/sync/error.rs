use std::{io, path::PathBuf};

use containers::{BlockNumber, Bytes32};
use thiserror::Error;

use crate::{sync::peer_pool::PeerOutcome, types::DataKind};

/// Failure of a single request at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl TransportError {
    pub fn outcome(&self) -> PeerOutcome {
        match self {
            TransportError::Timeout | TransportError::Disconnected => PeerOutcome::Timeout,
            TransportError::ProtocolViolation(_) => PeerOutcome::ProtocolViolation,
        }
    }
}

/// Data rejected by the validator collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("header {number} does not link to its parent")]
    BrokenLink { number: BlockNumber },
    #[error("expected block {expected}, got {actual}")]
    UnexpectedNumber {
        expected: BlockNumber,
        actual: BlockNumber,
    },
    #[error("transactions root mismatch at block {number}")]
    TransactionsRoot { number: BlockNumber },
    #[error("receipts root mismatch at block {number}")]
    ReceiptsRoot { number: BlockNumber },
    #[error("state node does not hash to {expected}")]
    NodeHash { expected: Bytes32 },
    #[error("headers do not link to the trusted chain above them")]
    AnchorMismatch,
    #[error("execution of block {number} failed: {reason}")]
    Execution { number: BlockNumber, reason: String },
}

/// A response that counts against the peer that served it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerFault {
    #[error("empty response")]
    Empty,
    #[error("expected {expected} items, got {actual}")]
    WrongCount { expected: usize, actual: usize },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PeerFault {
    pub fn outcome(&self) -> PeerOutcome {
        match self {
            PeerFault::Transport(error) => error.outcome(),
            PeerFault::Empty | PeerFault::WrongCount { .. } | PeerFault::Invalid(_) => {
                PeerOutcome::InvalidData
            }
        }
    }
}

/// Persistence refused a write that does not adjoin the stored range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} write at {start} does not adjoin stored range (expected {expected:?})")]
pub struct GapError {
    pub kind: DataKind,
    pub start: BlockNumber,
    pub expected: Option<BlockNumber>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} barrier {barrier} is above pivot {pivot}")]
    BarrierAbovePivot {
        name: &'static str,
        barrier: BlockNumber,
        pivot: BlockNumber,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("pivot_hash requires a numeric pivot_number")]
    HashWithoutNumber,
    #[error("failed to read config {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] serde_yaml::Error),
}

/// No initialized, unallocated peer matched the allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no peer available")]
pub struct PeerUnavailable;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    PeerUnavailable(#[from] PeerUnavailable),
    #[error(transparent)]
    PeerFault(#[from] PeerFault),
    #[error(transparent)]
    Gap(#[from] GapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
