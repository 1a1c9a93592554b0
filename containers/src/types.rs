use alloy_primitives::B256;
use hex::FromHex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Height of a block in the canonical chain. Genesis is block 0.
pub type BlockNumber = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bytes32(pub B256);

impl Bytes32 {
    pub const ZERO: Bytes32 = Bytes32(B256::ZERO);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Bytes32(B256::from(bytes))
    }
}

impl FromStr for Bytes32 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes: [u8; 32] = <[u8; 32]>::from_hex(s)?;
        Ok(Bytes32::from(bytes))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.as_bytes()))
    }
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> Bytes32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Bytes32::from(digest)
}

/// Commitment to an ordered list of leaf hashes.
///
/// The leaf count is hashed in first so that an empty list and a list
/// of zero hashes commit to different roots.
pub fn ordered_root<I>(leaves: I) -> Bytes32
where
    I: IntoIterator<Item = Bytes32>,
{
    let leaves: Vec<Bytes32> = leaves.into_iter().collect();
    let mut hasher = Sha256::new();
    hasher.update((leaves.len() as u64).to_be_bytes());
    for leaf in &leaves {
        hasher.update(leaf.as_bytes());
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Bytes32::from(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes32_parses_with_and_without_prefix() {
        let hex = "11".repeat(32);
        let plain: Bytes32 = hex.parse().unwrap();
        let prefixed: Bytes32 = format!("0x{hex}").parse().unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain.to_string(), format!("0x{hex}"));
    }

    #[test]
    fn bytes32_serializes_as_hex_string() {
        let hash = sha256(&[b"pivot".as_slice()]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        assert_eq!(serde_json::from_str::<Bytes32>(&json).unwrap(), hash);
    }

    #[test]
    fn bytes32_rejects_short_input() {
        assert!("abcd".parse::<Bytes32>().is_err());
    }

    #[test]
    fn ordered_root_depends_on_count_and_order() {
        let a = sha256(&[b"a".as_slice()]);
        let b = sha256(&[b"b".as_slice()]);
        assert_ne!(ordered_root([a, b]), ordered_root([b, a]));
        assert_ne!(ordered_root(Vec::new()), ordered_root(vec![Bytes32::ZERO]));
    }
}
