use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sha3::{Digest, Sha3_256};

use crate::error::DhtError;
use crate::KEY_LENGTH;

/// A 160-bit identifier of a node in the keyspace.
///
/// Ids are ordered lexicographically over their bytes, which is the same as comparing them as
/// big-endian unsigned integers. The XOR distance between two ids is itself a `NodeId`, so
/// closeness is ordered by the same comparison.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Copy, Hash, Default)]
pub struct NodeId(pub [u8; KEY_LENGTH]);

impl NodeId {
    /// Constructs a new `NodeId` from a byte array.
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        NodeId(data)
    }

    /// Constructs a new, random `NodeId`.
    pub fn random() -> Self {
        NodeId(rand::random::<[u8; KEY_LENGTH]>())
    }

    /// Derives a `NodeId` from a public key by keeping its first `KEY_LENGTH` bytes.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(&public_key[..KEY_LENGTH]);
        NodeId(ret)
    }

    /// Maps an arbitrary string key into the keyspace using SHA3-256 truncated to `KEY_LENGTH`
    /// bytes.
    pub fn from_key(key: &str) -> Self {
        let digest = Sha3_256::digest(key.as_bytes());
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(&digest[..KEY_LENGTH]);
        NodeId(ret)
    }

    /// Parses a `NodeId` from raw bytes, which must be exactly `KEY_LENGTH` long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != KEY_LENGTH {
            return Err(DhtError::InvalidNodeId(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(bytes);
        Ok(NodeId(ret))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Returns the XOR distance between `self` and `other`.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(ret)
    }

    /// Returns the number of leading zero bits in `self`. For a distance this is the length of
    /// the prefix shared by the two ids it was computed from.
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for byte in &self.0 {
            if *byte == 0 {
                ret += 8
            } else {
                return ret + byte.leading_zeros() as usize;
            }
        }
        ret
    }

    /// Returns `true` if every bit is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Returns a copy of `self` with the bit at `index` flipped, counting from the most
    /// significant bit.
    pub fn flip_bit(&self, index: usize) -> NodeId {
        let mut ret = *self;
        ret.0[index / 8] ^= 0x80 >> (index % 8);
        ret
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| DhtError::InvalidNodeId(err.to_string()))?;
        NodeId::from_bytes(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
