//! Sync engine configuration.
//!
//! Tuning constants live here as `pub const`s. Everything an operator may
//! want to change is a field of [`SyncConfig`].
use std::{fmt, path::Path, str::FromStr, time::Duration};

use containers::{BlockNumber, Bytes32};
use serde::{Deserialize, Serialize};

use super::{backoff::Backoff, error::ConfigError};
use crate::types::DataKind;

/// Score assigned to a freshly connected peer.
pub const INITIAL_PEER_SCORE: i32 = 100;

/// Upper bound for a peer's score.
pub const MAX_PEER_SCORE: i32 = 100;

/// Peers below this score are only allocated when nobody better is free.
pub const LOW_SCORE_THRESHOLD: i32 = 50;

/// Peers at or below this score are banned.
pub const BAN_SCORE: i32 = 0;

/// Protocol violations tolerated before a ban regardless of score.
pub const MAX_SEVERE_VIOLATIONS: u32 = 3;

pub const SCORE_SUCCESS: i32 = 1;
pub const SCORE_TIMEOUT: i32 = -5;
pub const SCORE_INVALID_DATA: i32 = -20;
pub const SCORE_PROTOCOL_VIOLATION: i32 = -40;

/// How long a peer that timed out is skipped by allocation.
pub const PEER_TIMEOUT_SLEEP: Duration = Duration::from_secs(2);

/// Recheck interval for batches waiting on data from another feed.
pub const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait before retrying a batch no peer could be allocated for.
pub const ALLOCATION_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Interval between pivot staleness checks.
pub const PIVOT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Fast-sync pivot selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PivotNumber {
    /// Derive the pivot from the best peer head.
    Latest,
    #[serde(untagged)]
    Number(BlockNumber),
}

impl PivotNumber {
    pub fn number(&self) -> Option<BlockNumber> {
        match self {
            PivotNumber::Latest => None,
            PivotNumber::Number(number) => Some(*number),
        }
    }
}

impl Default for PivotNumber {
    fn default() -> Self {
        PivotNumber::Latest
    }
}

impl FromStr for PivotNumber {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(PivotNumber::Latest);
        }
        s.parse().map(PivotNumber::Number)
    }
}

impl fmt::Display for PivotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PivotNumber::Latest => f.write_str("latest"),
            PivotNumber::Number(number) => write!(f, "{number}"),
        }
    }
}

/// Session configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub fast_sync: bool,
    pub pivot_number: PivotNumber,
    pub pivot_hash: Option<Bytes32>,
    /// Oldest block whose body is downloaded. `None` downloads to genesis.
    pub ancient_bodies_barrier: Option<BlockNumber>,
    /// Oldest block whose receipts are downloaded. `None` downloads to genesis.
    pub ancient_receipts_barrier: Option<BlockNumber>,
    pub download_bodies_in_fast_sync: bool,
    pub download_receipts_in_fast_sync: bool,
    /// Distance behind the best peer beyond which fast sync is used.
    pub fast_sync_lag: u64,
    pub pivot_distance_from_head: u64,
    pub pivot_max_lag: u64,
    pub pivot_stall_timeout_ms: u64,
    pub headers_batch_size: u64,
    pub bodies_batch_size: u64,
    pub receipts_batch_size: u64,
    pub state_batch_size: u64,
    pub full_batch_size: u64,
    pub max_in_flight: usize,
    pub max_queued_items: u64,
    pub request_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub report_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_sync: true,
            pivot_number: PivotNumber::Latest,
            pivot_hash: None,
            ancient_bodies_barrier: None,
            ancient_receipts_barrier: None,
            download_bodies_in_fast_sync: true,
            download_receipts_in_fast_sync: true,
            fast_sync_lag: 32,
            pivot_distance_from_head: 64,
            pivot_max_lag: 1024,
            pivot_stall_timeout_ms: 60_000,
            headers_batch_size: 192,
            bodies_batch_size: 128,
            receipts_batch_size: 128,
            state_batch_size: 384,
            full_batch_size: 16,
            max_in_flight: 8,
            max_queued_items: 4096,
            request_timeout_ms: 10_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            report_interval_ms: 5_000,
        }
    }
}

/// Per-feed slice of [`SyncConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub max_in_flight: usize,
    pub max_queued_items: u64,
    pub request_timeout: Duration,
    pub backoff: Backoff,
}

impl SyncConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("headers_batch_size", self.headers_batch_size),
            ("bodies_batch_size", self.bodies_batch_size),
            ("receipts_batch_size", self.receipts_batch_size),
            ("state_batch_size", self.state_batch_size),
            ("full_batch_size", self.full_batch_size),
            ("max_in_flight", self.max_in_flight as u64),
            ("max_queued_items", self.max_queued_items),
            ("request_timeout_ms", self.request_timeout_ms),
            ("report_interval_ms", self.report_interval_ms),
        ];
        if let Some((name, _)) = sizes.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }

        let pivot = match self.pivot_number {
            PivotNumber::Number(pivot) => pivot,
            PivotNumber::Latest if self.pivot_hash.is_some() => {
                return Err(ConfigError::HashWithoutNumber);
            }
            PivotNumber::Latest => return Ok(()),
        };

        let barriers = [
            ("ancient_bodies", self.ancient_bodies_barrier),
            ("ancient_receipts", self.ancient_receipts_barrier),
        ];
        for (name, barrier) in barriers {
            if let Some(barrier) = barrier {
                if barrier > pivot {
                    return Err(ConfigError::BarrierAbovePivot {
                        name,
                        barrier,
                        pivot,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn pivot_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.pivot_stall_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn batch_size(&self, kind: DataKind) -> u64 {
        match kind {
            DataKind::Headers => self.headers_batch_size,
            DataKind::Bodies => self.bodies_batch_size,
            DataKind::Receipts => self.receipts_batch_size,
            DataKind::StateNodes => self.state_batch_size,
            DataKind::Blocks => self.full_batch_size,
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            max_in_flight: self.max_in_flight,
            max_queued_items: self.max_queued_items,
            request_timeout: self.request_timeout(),
            backoff: self.backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_barrier_above_pivot_rejected() {
        let config = SyncConfig {
            pivot_number: PivotNumber::Number(100),
            ancient_receipts_barrier: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BarrierAbovePivot {
                barrier: 101,
                pivot: 100,
                ..
            })
        ));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let config = SyncConfig {
            bodies_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("bodies_batch_size"))
        ));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = "fast_sync: true\npivot_number: 100\nancient_bodies_barrier: 30\n";
        let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pivot_number, PivotNumber::Number(100));
        assert_eq!(config.ancient_bodies_barrier, Some(30));
        assert_eq!(config.headers_batch_size, 192);

        let latest: SyncConfig = serde_yaml::from_str("pivot_number: latest\n").unwrap();
        assert_eq!(latest.pivot_number, PivotNumber::Latest);
    }

    #[test]
    fn test_pivot_number_from_str() {
        assert_eq!("latest".parse::<PivotNumber>().unwrap(), PivotNumber::Latest);
        assert_eq!("42".parse::<PivotNumber>().unwrap(), PivotNumber::Number(42));
        assert!("soon".parse::<PivotNumber>().is_err());
    }
}
