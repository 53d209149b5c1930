//! # Node and Topic Identity
//!
//! Peers and topics are identified by opaque 32-byte hashes. The discovery
//! core never creates or verifies node identities; it consumes ID hashes
//! produced elsewhere and treats the hash function as an oracle (blake3).
//!
//! The high 64 bits of a hash are its **prefix**: topic radii, lookup
//! targets and in-radius checks all operate on XOR distances between
//! prefixes, never on full hashes.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A 32-byte hash value.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

/// Node identifier: the hash of the node's public identity.
pub type NodeId = Hash;

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The high 64 bits, big-endian. All radius arithmetic happens in this
    /// prefix space.
    pub fn prefix(&self) -> u64 {
        u64::from_be_bytes(self.0[0..8].try_into().unwrap())
    }

    /// A hash whose prefix is `prefix` and whose remaining bytes are zero.
    /// Used as a lookup target: only the prefix steers the search.
    pub fn from_prefix(prefix: u64) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&prefix.to_be_bytes());
        Hash(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Hash::ZERO
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Hash arbitrary bytes with the crate's hash oracle.
pub fn hash_of(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// XOR distance between two 64-bit prefixes.
pub fn prefix_distance(a: u64, b: u64) -> u64 {
    a ^ b
}

/// A peer as seen by the discovery core: an ID hash plus a dialable
/// endpoint. Identity is given, never created here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub endpoint: SocketAddr,
}

impl NodeRecord {
    pub fn new(id: NodeId, endpoint: SocketAddr) -> Self {
        NodeRecord { id, endpoint }
    }
}

/// Protocol-level service label advertised by peers.
///
/// Topics are opaque byte strings; each derives a 64-bit prefix from the
/// high bits of its hash, placing it in the same prefix space as node IDs.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The topic's 64-bit prefix in node-ID space.
    pub fn prefix(&self) -> u64 {
        hash_of(self.0.as_bytes()).prefix()
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic(s.to_owned())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_high_64_bits_big_endian() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[7] = 0xcd;
        bytes[8] = 0xff; // past the prefix, must not contribute
        let h = Hash::from_bytes(bytes);
        assert_eq!(h.prefix(), 0xab00_0000_0000_00cd);
    }

    #[test]
    fn from_prefix_round_trips() {
        let p = 0x0123_4567_89ab_cdef_u64;
        let h = Hash::from_prefix(p);
        assert_eq!(h.prefix(), p);
        assert_eq!(&h.0[8..], &[0u8; 24]);
    }

    #[test]
    fn topic_prefix_is_stable_and_distinct() {
        let a = Topic::from("chain.v1");
        let b = Topic::from("chain.v2");
        assert_eq!(a.prefix(), Topic::from("chain.v1").prefix());
        assert_ne!(a.prefix(), b.prefix());
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Topic::from("alpha").prefix();
        let b = Topic::from("beta").prefix();
        assert_eq!(prefix_distance(a, b), prefix_distance(b, a));
        assert_eq!(prefix_distance(a, a), 0);
    }
}
