//! Collaborator trait definitions for the light-serving core.
//!
//! The CHT builder and the head announcement loop touch three external
//! systems the crate does not implement: the canonical chain store, the
//! Merkle trie library, and the set of connected light peers. Each seam is
//! a trait defined here, separately from any implementation.
//!
//! ## Seams
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Chain store | [`ChainStore`] | Read-only canonical chain access |
//! | Merkle trie | [`ChtTrie`] / [`TrieFactory`] | Commit CHT entries to a root |
//! | Peer set | [`LightPeer`] / [`PeerSet`] | Announce new heads to light clients |
//!
//! Defining the traits here lets the background loops depend only on the
//! seams, keeps test fixtures in-process, and avoids circular dependencies
//! between modules.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Hash;

/// A new canonical chain head, as delivered by the node's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHeadEvent {
    pub hash: Hash,
    pub number: u64,
}

/// Head announcement forwarded to connected light clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadAnnouncement {
    pub hash: Hash,
    pub number: u64,
    pub td: u128,
}

/// Read-only view of the canonical chain.
///
/// A missing canonical hash or total difficulty for a block inside a CHT
/// range is chain corruption; the builder treats it as fatal.
pub trait ChainStore: Send + Sync {
    fn head_block_hash(&self) -> Hash;

    /// Number of the block with the given hash, if known.
    fn block_number(&self, hash: &Hash) -> Option<u64>;

    /// Canonical hash at the given height.
    fn canonical_hash(&self, number: u64) -> Option<Hash>;

    /// Total difficulty of the given canonical block.
    fn td(&self, hash: &Hash, number: u64) -> Option<u128>;
}

/// One open Merkle trie accumulating CHT entries.
pub trait ChtTrie: Send {
    fn update(&mut self, key: &[u8], value: &[u8]);

    /// Commit all updates, returning the new root hash.
    fn commit(&mut self) -> Result<Hash>;
}

/// Opens tries by root hash. [`Hash::ZERO`] opens an empty trie; any other
/// root must exist in the backing store or the open fails.
pub trait TrieFactory: Send + Sync {
    type Trie: ChtTrie;

    fn open(&self, root: Hash) -> Result<Self::Trie>;
}

/// One connected light client, as a target for head announcements.
#[async_trait]
pub trait LightPeer: Send + Sync {
    async fn send_new_block_hashes(&self, announce: Vec<HeadAnnouncement>) -> Result<()>;
}

/// The currently connected light peers.
pub trait PeerSet: Send + Sync {
    fn all_peers(&self) -> Vec<Arc<dyn LightPeer>>;
}
