//! # Node Database
//!
//! Shared key-value persistence for the discovery and light-serving state.
//! Three consumers write disjoint key ranges: per-node ticket counters, CHT
//! roots, and the request-cost statistics blob. Writes are idempotent and
//! last-writer-wins; memory state is always authoritative, so persistence
//! failures are logged and otherwise ignored.
//!
//! ## Key Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `"LastChtNumber"` | last completed CHT number, 8-byte big-endian |
//! | `"cht" \|\| be64(n)` | 32-byte trie root of CHT `n` |
//! | `"_requestCostStats"` | RLP list of per-msgcode regression state |
//! | `"tkt:" \|\| node_id` | ticket serial counters (adapter-opaque record) |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bincode::Options;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::identity::{Hash, NodeId};

pub(crate) const LAST_CHT_KEY: &[u8] = b"LastChtNumber";
pub(crate) const CHT_PREFIX: &[u8] = b"cht";
pub(crate) const COST_STATS_KEY: &[u8] = b"_requestCostStats";
const TICKET_COUNTER_PREFIX: &[u8] = b"tkt:";

/// Maximum size accepted when decoding an adapter record.
const MAX_RECORD_SIZE: u64 = 4096;

/// Backing key-value store. Implementations must be safe to call from
/// multiple tasks; the crate only requires point get/put.
pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// In-memory [`Database`] used by tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryDb {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// Ticket serial counters persisted per node. The record format is private
/// to this adapter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct TicketCounters {
    issued: u32,
    used: u32,
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_RECORD_SIZE)
        .with_fixint_encoding()
}

/// Typed access to the node database's key ranges.
#[derive(Clone)]
pub struct NodeDb {
    db: Arc<dyn Database>,
}

impl NodeDb {
    pub fn new(db: Arc<dyn Database>) -> Self {
        NodeDb { db }
    }

    /// Last issued and last used ticket serials for a node. Missing or
    /// undecodable records read as zeros.
    pub fn fetch_topic_reg_tickets(&self, id: &NodeId) -> (u32, u32) {
        let counters = match self.db.get(&ticket_counter_key(id)) {
            Ok(Some(data)) => bincode_options().deserialize(&data).unwrap_or_default(),
            Ok(None) => TicketCounters::default(),
            Err(err) => {
                warn!(node = %id, %err, "ticket counter read failed");
                TicketCounters::default()
            }
        };
        (counters.issued, counters.used)
    }

    pub fn update_topic_reg_tickets(&self, id: &NodeId, issued: u32, used: u32) {
        let record = TicketCounters { issued, used };
        let data = match bincode_options().serialize(&record) {
            Ok(data) => data,
            Err(err) => {
                warn!(node = %id, %err, "ticket counter encode failed");
                return;
            }
        };
        if let Err(err) = self.db.put(&ticket_counter_key(id), &data) {
            warn!(node = %id, %err, "ticket counter write failed");
        }
    }

    /// Root of CHT number `num`, if one was committed.
    pub fn cht_root(&self, num: u64) -> Option<Hash> {
        match self.db.get(&cht_root_key(num)) {
            Ok(Some(data)) if data.len() == 32 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&data);
                Some(Hash::from_bytes(bytes))
            }
            Ok(_) => None,
            Err(err) => {
                warn!(cht = num, %err, "cht root read failed");
                None
            }
        }
    }

    pub fn store_cht_root(&self, num: u64, root: Hash) {
        if let Err(err) = self.db.put(&cht_root_key(num), root.as_bytes()) {
            warn!(cht = num, %err, "cht root write failed");
        }
    }

    /// Number of the last completed CHT; zero if none was built yet or the
    /// stored value is malformed.
    pub fn last_cht_number(&self) -> u64 {
        match self.db.get(LAST_CHT_KEY) {
            Ok(Some(data)) if data.len() == 8 => {
                u64::from_be_bytes(data.try_into().unwrap())
            }
            Ok(_) => 0,
            Err(err) => {
                warn!(%err, "last cht number read failed");
                0
            }
        }
    }

    pub fn store_last_cht_number(&self, num: u64) {
        if let Err(err) = self.db.put(LAST_CHT_KEY, &num.to_be_bytes()) {
            warn!(cht = num, %err, "last cht number write failed");
        }
    }

    pub fn load_cost_stats(&self) -> Option<Vec<u8>> {
        match self.db.get(COST_STATS_KEY) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "cost stats read failed");
                None
            }
        }
    }

    pub fn store_cost_stats(&self, blob: &[u8]) {
        if let Err(err) = self.db.put(COST_STATS_KEY, blob) {
            warn!(%err, "cost stats write failed");
        }
    }
}

fn ticket_counter_key(id: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(TICKET_COUNTER_PREFIX.len() + 32);
    key.extend_from_slice(TICKET_COUNTER_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

fn cht_root_key(num: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHT_PREFIX.len() + 8);
    key.extend_from_slice(CHT_PREFIX);
    key.extend_from_slice(&num.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_of;

    #[test]
    fn ticket_counters_round_trip() {
        let db = NodeDb::new(Arc::new(MemoryDb::new()));
        let id = hash_of(b"node-1");
        assert_eq!(db.fetch_topic_reg_tickets(&id), (0, 0));
        db.update_topic_reg_tickets(&id, 17, 12);
        assert_eq!(db.fetch_topic_reg_tickets(&id), (17, 12));
        // counters are per node
        assert_eq!(db.fetch_topic_reg_tickets(&hash_of(b"node-2")), (0, 0));
    }

    #[test]
    fn cht_keys_are_bit_exact() {
        let mem = Arc::new(MemoryDb::new());
        let db = NodeDb::new(mem.clone());
        let root = hash_of(b"root");
        db.store_cht_root(3, root);
        db.store_last_cht_number(3);

        let mut key = b"cht".to_vec();
        key.extend_from_slice(&3u64.to_be_bytes());
        assert_eq!(mem.get(&key).unwrap().unwrap(), root.as_bytes());
        assert_eq!(
            mem.get(b"LastChtNumber").unwrap().unwrap(),
            3u64.to_be_bytes()
        );
    }

    #[test]
    fn malformed_stored_values_read_as_defaults() {
        let mem = Arc::new(MemoryDb::new());
        mem.put(b"LastChtNumber", b"bad").unwrap();
        let db = NodeDb::new(mem);
        assert_eq!(db.last_cht_number(), 0);
        assert_eq!(db.cht_root(1), None);
    }
}
