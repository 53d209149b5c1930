//! # Lumen - Topic Discovery and Light-Serving Core
//!
//! Lumen is the adaptive core of a public blockchain node, covering the two
//! halves that need real state machines and control loops:
//!
//! - **Topic advertisement**: peers announce which protocol topics they
//!   serve and searchers locate peers for a topic, with ticket-gated
//!   admission, capacity fairness across topics and nodes, and per-topic
//!   radii that converge onto the right region of the ID space.
//! - **Light serving**: a full node acting as a light server rate-limits
//!   each client with a token-bucket whose per-request costs are learned
//!   online by linear regression, and periodically commits canonical hash
//!   trie (CHT) checkpoints so light clients can verify headers by proof.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `clock` | Monotonic timestamps, time buckets, injectable clocks |
//! | `identity` | 32-byte hashes, node records, topics, prefix distances |
//! | `topic` | Server role: advertisement table, wait control, eviction |
//! | `ticket` | Client role: ticket collection, scheduling, topic radii |
//! | `flowcontrol` | Per-client token-bucket request admission |
//! | `costs` | Online request cost regression and the advertised table |
//! | `cht` | Canonical hash trie builder and head announcement loop |
//! | `protocols` | Trait seams: chain store, Merkle trie, peer set |
//! | `db` | Node database adapter over a key-value store |
//! | `rlp` | Minimal RLP codec for the fixed persistence payloads |
//! | `server` | Light server lifecycle combining the serving subsystems |
//!
//! ## Concurrency Model
//!
//! Stateful components are single-owner state machines: `TopicTable` and
//! `TicketStore` take `&mut self` and belong to their owning event loop,
//! while `ClientManager` and `RequestCostStats` carry an interior lock
//! because per-peer request tasks share them. The CHT head loop is the one
//! long-lived background task, driven by channels and terminated
//! cooperatively. All timing is monotonic and injectable, so every control
//! loop is testable without sleeping.

mod cht;
mod clock;
mod costs;
mod db;
mod flowcontrol;
mod identity;
mod protocols;
mod rlp;
mod server;
mod ticket;
mod topic;

pub use cht::{spawn_head_loop, ChtBuilder, ChtConfig};
pub use clock::{AbsTime, Clock, ManualClock, MonotonicClock, TimeBucket, TimeSource};
pub use costs::{
    cost_list, cost_table, RequestCostEntry, RequestCostList, RequestCostStats, RequestCosts,
    LIN_REG_MAX_CNT,
};
pub use db::{Database, MemoryDb, NodeDb};
pub use flowcontrol::{Admission, ClientManager, ServerParams};
pub use identity::{hash_of, prefix_distance, Hash, NodeId, NodeRecord, Topic};
pub use protocols::{
    ChainHeadEvent, ChainStore, ChtTrie, HeadAnnouncement, LightPeer, PeerSet, TrieFactory,
};
pub use server::{LightServer, LightServerConfig, DEFAULT_SERVER_PARAMS};
pub use ticket::{LookupInfo, Ticket, TicketRef, TicketStore, TopicRadius, MAX_RADIUS};
pub use topic::{
    IssuedTicket, TopicTable, WaitControlLoop, MAX_ENTRIES, MAX_ENTRIES_PER_TOPIC,
    MIN_WAIT_PERIOD, REG_TIME_WINDOW,
};
