//! Node identifiers and the XOR distance metric

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::BitXor;
use std::str::FromStr;

/// Identifier width in bytes (160 bits)
pub const ID_LEN: usize = 20;

/// A fixed-width node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Deterministic id: SHA-256 of `seed`, truncated to 160 bits
    pub fn derive(seed: &[u8]) -> Self {
        let digest = Sha256::digest(seed);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest[..ID_LEN]);
        Self(id)
    }

    /// Generate a cryptographically random node ID
    pub fn random() -> Self {
        let mut entropy = [0u8; 32];
        getrandom::getrandom(&mut entropy).expect("Failed to generate random bytes");
        Self::derive(&entropy)
    }

    /// Parse a 40-character hex id
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut id = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Position of an arbitrary DHT key in the id space.
    ///
    /// Hex keys use their leading 160 bits (zero-padded when shorter), so a
    /// SHA-256 chunk hash lands next to the ids sharing its prefix. Anything
    /// else is hashed with [`NodeId::derive`].
    pub fn for_key(key: &str) -> Self {
        match hex::decode(key) {
            Ok(bytes) if !bytes.is_empty() => {
                let mut id = [0u8; ID_LEN];
                let n = bytes.len().min(ID_LEN);
                id[..n].copy_from_slice(&bytes[..n]);
                Self(id)
            }
            _ => Self::derive(key.as_bytes()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", &self.to_hex()[..8])
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(|e| de::Error::custom(format!("invalid node id '{}': {}", s, e)))
    }
}

/// XOR distance, compared as a 160-bit big-endian unsigned integer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    pub fn between(a: &NodeId, b: &NodeId) -> Self {
        let mut result = [0u8; ID_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = a.0[i] ^ b.0[i];
        }
        Self(result)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits (the shared prefix length of the two ids)
    pub fn leading_zeros(&self) -> u32 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i as u32 * 8 + byte.leading_zeros();
            }
        }
        ID_LEN as u32 * 8
    }
}

impl BitXor for Distance {
    type Output = Distance;

    fn bitxor(self, rhs: Distance) -> Distance {
        let mut result = [0u8; ID_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }
        Distance(result)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// XOR distance between two node IDs
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    Distance::between(a, b)
}
