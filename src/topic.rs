//! # Topic Advertisement Table (server role)
//!
//! A node serving the discovery protocol accepts topic advertisements from
//! remote peers and answers "who advertises topic T?" queries. Capacity is
//! enforced fairly on two axes:
//!
//! - **Per topic**: at most [`MAX_ENTRIES_PER_TOPIC`] entries, FIFO eviction
//!   (oldest advertisement leaves first).
//! - **Globally**: at most [`MAX_ENTRIES`] entries across all topics; when
//!   full, the victim comes from the *least recently requested* topic, so an
//!   unpopular topic cannot wedge old entries at the expense of hot ones.
//!
//! Admission is ticket-gated: a registrant first obtains a ticket carrying a
//! per-topic wait period, then presents it inside a narrow time window. Each
//! topic runs a [`WaitControlLoop`] that tunes its wait period toward one
//! incoming advertisement per [`WC_TARGET_REG_INTERVAL`], growing the period
//! exponentially under load and relaxing it when quiet.
//!
//! ## Concurrency
//!
//! `TopicTable` is a single-owner state machine: all methods take `&mut
//! self` and the owning event loop serializes access. Persistence failures
//! never roll back in-memory state.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::clock::{AbsTime, Clock, NANOS_PER_SEC};
use crate::db::NodeDb;
use crate::identity::{NodeId, NodeRecord, Topic};

/// Global advertisement capacity across all topics.
pub const MAX_ENTRIES: usize = 10_000;

/// Advertisement capacity of a single topic.
pub const MAX_ENTRIES_PER_TOPIC: usize = 50;

/// Floor for the advertised wait period.
pub const MIN_WAIT_PERIOD: Duration = Duration::from_secs(60);

/// Slack (seconds) allowed between a ticket's declared wait period and the
/// moment it is presented.
pub const REG_TIME_WINDOW: u32 = 10;

/// Mean of the exponential no-ticket backoff imposed after a successful
/// registration.
const AVG_NO_TICKET_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Target average interval between two incoming ad requests per topic.
const WC_TARGET_REG_INTERVAL: Duration =
    Duration::from_nanos(10 * 60 * NANOS_PER_SEC / MAX_ENTRIES_PER_TOPIC as u64);

/// Time constant of the wait-period control loop.
const WC_TIME_CONST: Duration = Duration::from_secs(10 * 60);

/// Minimum spacing between garbage collection passes.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// One advertisement: a node registered under a topic until `expire`.
#[derive(Debug, Clone)]
struct TopicEntry {
    fifo_idx: u64,
    node: NodeRecord,
    expire: AbsTime,
}

/// Location of an entry in both indices, enough to delete it atomically.
#[derive(Debug, Clone)]
struct EntryRef {
    topic: Topic,
    fifo_idx: u64,
    node: NodeId,
}

/// Per-topic server state.
struct TopicInfo {
    /// FIFO of live entries keyed by insertion index. Holes appear where
    /// entries were evicted out of order; the tail scan skips them.
    entries: HashMap<u64, TopicEntry>,
    fifo_head: u64,
    fifo_tail: u64,
    /// Global request counter value at the topic's most recent query.
    priority: u64,
    wcl: WaitControlLoop,
}

impl TopicInfo {
    fn new(priority: u64) -> Self {
        TopicInfo {
            entries: HashMap::new(),
            fifo_head: 0,
            fifo_tail: 0,
            priority,
            wcl: WaitControlLoop::default(),
        }
    }

    /// Oldest live entry. Must only be called on a non-empty topic.
    fn fifo_tail_idx(&mut self) -> u64 {
        while !self.entries.contains_key(&self.fifo_tail) {
            self.fifo_tail += 1;
        }
        let idx = self.fifo_tail;
        self.fifo_tail += 1;
        idx
    }
}

/// Per-node server state.
struct NodeInfo {
    /// The single active entry per topic, by FIFO index.
    entries: HashMap<Topic, u64>,
    no_ticket_until: AbsTime,
    last_issued_ticket: u32,
    last_used_ticket: u32,
}

/// A ticket issued to a registrant: serial number plus per-topic absolute
/// registration times, in whole seconds of the server's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTicket {
    pub serial: u32,
    pub curr_time: u32,
    pub wait_until: Vec<u32>,
}

/// Server-side advertisement table. See the module docs for the fairness
/// and admission rules.
pub struct TopicTable {
    db: NodeDb,
    clock: Clock,
    rng: StdRng,
    nodes: HashMap<NodeId, NodeInfo>,
    topics: HashMap<Topic, TopicInfo>,
    global_entries: usize,
    requested: RequestQueue,
    request_cnt: u64,
    last_gc: AbsTime,
}

impl TopicTable {
    pub fn new(db: NodeDb, clock: Clock) -> Self {
        Self::with_rng(db, clock, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied RNG; tests seed this for
    /// deterministic backoff.
    pub fn with_rng(db: NodeDb, clock: Clock, rng: StdRng) -> Self {
        TopicTable {
            db,
            clock,
            rng,
            nodes: HashMap::new(),
            topics: HashMap::new(),
            global_entries: 0,
            requested: RequestQueue::new(),
            request_cnt: 0,
            last_gc: AbsTime::ZERO,
        }
    }

    /// Snapshot of the nodes currently advertising `topic`, in unspecified
    /// order. Bumps the topic's request priority so recently queried topics
    /// rank later for global eviction.
    pub fn get_entries(&mut self, topic: &Topic) -> Vec<NodeRecord> {
        self.collect_garbage();

        let Some(info) = self.topics.get_mut(topic) else {
            return Vec::new();
        };
        let nodes = info.entries.values().map(|e| e.node.clone()).collect();
        self.request_cnt += 1;
        info.priority = self.request_cnt;
        self.requested.update(topic, self.request_cnt);
        nodes
    }

    /// Register `node` under `topics`, evicting as needed. Any previous
    /// entries by the same node are cleared first, so a node holds at most
    /// one entry per topic.
    pub fn add_entries(&mut self, node: &NodeRecord, topics: &[Topic], expiry: Duration) {
        let now = self.clock.now();
        self.ensure_node(&node.id);
        let previous: Vec<EntryRef> = self.nodes[&node.id]
            .entries
            .iter()
            .map(|(topic, &fifo_idx)| EntryRef {
                topic: topic.clone(),
                fifo_idx,
                node: node.id,
            })
            .collect();
        for eref in previous {
            self.delete_entry(&eref, now);
        }

        for topic in topics {
            let request_cnt = self.request_cnt;
            let info = self
                .topics
                .entry(topic.clone())
                .or_insert_with(|| TopicInfo::new(request_cnt));

            if info.entries.len() == MAX_ENTRIES_PER_TOPIC {
                let idx = info.fifo_tail_idx();
                let victim = EntryRef { topic: topic.clone(), fifo_idx: idx, node: info.entries[&idx].node.id };
                trace!(topic = %topic, node = %victim.node, "topic full, evicting tail");
                self.delete_entry(&victim, now);
            }

            if self.global_entries == MAX_ENTRIES {
                // Never empty when the table is at capacity.
                let victim = self.least_requested().unwrap();
                trace!(topic = %victim.topic, node = %victim.node, "table full, evicting least requested");
                self.delete_entry(&victim, now);
            }

            // Evictions may have pruned the very records being filled:
            // deleting a topic's (or this node's) last entry drops the
            // emptied record. Re-create before inserting.
            self.ensure_node(&node.id);
            let info = self
                .topics
                .entry(topic.clone())
                .or_insert_with(|| TopicInfo::new(request_cnt));
            let fifo_idx = info.fifo_head;
            info.fifo_head += 1;
            info.entries.insert(
                fifo_idx,
                TopicEntry { fifo_idx, node: node.clone(), expire: now + expiry },
            );
            if !self.requested.contains(topic) {
                self.requested.push(topic.clone(), info.priority);
            }
            info.wcl.registered(now);
            self.nodes
                .get_mut(&node.id)
                .unwrap()
                .entries
                .insert(topic.clone(), fifo_idx);
            self.global_entries += 1;
        }
    }

    /// Present a ticket for registration. Admits each topic whose declared
    /// wait period falls inside the registration window and which the node
    /// is not already advertising. Returns whether anything was registered.
    pub fn use_ticket(
        &mut self,
        node: &NodeRecord,
        serial: u32,
        topics: &[Topic],
        wait_periods: &[u32],
        expiry: Duration,
    ) -> bool {
        debug_assert_eq!(topics.len(), wait_periods.len());
        self.collect_garbage();

        self.ensure_node(&node.id);
        {
            let info = self.nodes.get_mut(&node.id).unwrap();
            if serial < info.last_used_ticket {
                debug!(node = %node.id, serial, last = info.last_used_ticket, "stale ticket serial");
                return false;
            }
            if serial != info.last_used_ticket {
                info.last_used_ticket = serial;
                self.store_ticket_counters(&node.id);
            }
        }

        let tm = self.clock.now();
        let curr_time = tm.as_secs_u32();
        let mut reg_topics = Vec::new();
        for (topic, &w) in topics.iter().zip(wait_periods) {
            // Wrapping arithmetic keeps the check sound across second-counter
            // wrap; clients get one second of margin on both ends.
            let rel_time = curr_time.wrapping_sub(w) as i32;
            if (-1..=REG_TIME_WINDOW as i32 + 1).contains(&rel_time)
                && !self.nodes[&node.id].entries.contains_key(topic)
            {
                reg_topics.push(topic.clone());
            }
        }
        if reg_topics.is_empty() {
            return false;
        }

        self.add_entries(node, &reg_topics, expiry);
        let timeout = self.no_ticket_timeout();
        let info = self.nodes.get_mut(&node.id).unwrap();
        info.no_ticket_until = tm + timeout;
        true
    }

    /// Issue a fresh ticket for `topics`, or `None` while the node is inside
    /// its no-ticket backoff.
    pub fn get_ticket(&mut self, node: &NodeRecord, topics: &[Topic]) -> Option<IssuedTicket> {
        self.collect_garbage();

        let tm = self.clock.now();
        let curr_time = tm.as_secs_u32();
        self.ensure_node(&node.id);
        if self.nodes[&node.id].no_ticket_until > tm {
            trace!(node = %node.id, "ticket refused, node in backoff");
            return None;
        }
        self.nodes.get_mut(&node.id).unwrap().last_issued_ticket += 1;
        self.store_ticket_counters(&node.id);
        let serial = self.nodes[&node.id].last_issued_ticket;

        let wait_until = topics
            .iter()
            .map(|topic| {
                let wait = self
                    .topics
                    .get(topic)
                    .map(|info| info.wcl.wait_period)
                    .unwrap_or(MIN_WAIT_PERIOD.as_nanos() as u64);
                curr_time + (wait / NANOS_PER_SEC) as u32
            })
            .collect();
        Some(IssuedTicket { serial, curr_time, wait_until })
    }

    fn ensure_node(&mut self, id: &NodeId) {
        if !self.nodes.contains_key(id) {
            let (issued, used) = self.db.fetch_topic_reg_tickets(id);
            self.nodes.insert(
                *id,
                NodeInfo {
                    entries: HashMap::new(),
                    no_ticket_until: AbsTime::ZERO,
                    last_issued_ticket: issued,
                    last_used_ticket: used,
                },
            );
        }
    }

    fn store_ticket_counters(&self, id: &NodeId) {
        let info = &self.nodes[id];
        self.db
            .update_topic_reg_tickets(id, info.last_issued_ticket, info.last_used_ticket);
    }

    /// Victim for a global-capacity eviction: the tail entry of the topic
    /// with the lowest request priority.
    fn least_requested(&mut self) -> Option<EntryRef> {
        let topic = self.requested.peek_min()?.clone();
        let info = self.topics.get_mut(&topic)?;
        let idx = info.fifo_tail_idx();
        Some(EntryRef { topic, fifo_idx: idx, node: info.entries[&idx].node.id })
    }

    /// Remove one entry from both indices and prune emptied node/topic
    /// records. Deletion is atomic across the two maps.
    fn delete_entry(&mut self, eref: &EntryRef, now: AbsTime) {
        let node = self.nodes.get_mut(&eref.node).unwrap();
        node.entries.remove(&eref.topic);
        if node.entries.is_empty() {
            self.check_delete_node(&eref.node, now);
        }

        let info = self.topics.get_mut(&eref.topic).unwrap();
        info.entries.remove(&eref.fifo_idx);
        if info.entries.is_empty() {
            self.requested.remove(&eref.topic);
            self.check_delete_topic(&eref.topic, now);
        }
        self.global_entries -= 1;
    }

    fn check_delete_node(&mut self, id: &NodeId, now: AbsTime) {
        if let Some(info) = self.nodes.get(id) {
            if info.entries.is_empty() && info.no_ticket_until < now {
                self.nodes.remove(id);
            }
        }
    }

    /// An empty topic is only dropped once its control loop has relaxed back
    /// to the minimum wait period, so the learned period survives bursts.
    fn check_delete_topic(&mut self, topic: &Topic, now: AbsTime) {
        if let Some(info) = self.topics.get(topic) {
            if info.entries.is_empty() && info.wcl.has_minimum_wait_period(now) {
                self.topics.remove(topic);
            }
        }
    }

    /// Drop expired entries and prune empty records. Runs at most once per
    /// [`GC_INTERVAL`].
    fn collect_garbage(&mut self) {
        let now = self.clock.now();
        if now.saturating_since(self.last_gc) < GC_INTERVAL.as_nanos() as u64 {
            return;
        }
        self.last_gc = now;

        let expired: Vec<EntryRef> = self
            .topics
            .iter()
            .flat_map(|(topic, info)| {
                info.entries.values().filter(|e| e.expire <= now).map(|e| EntryRef {
                    topic: topic.clone(),
                    fifo_idx: e.fifo_idx,
                    node: e.node.id,
                })
            })
            .collect();
        let expired_count = expired.len();
        for eref in expired {
            self.delete_entry(&eref, now);
        }

        let node_ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in node_ids {
            self.check_delete_node(&id, now);
        }
        let topic_names: Vec<Topic> = self.topics.keys().cloned().collect();
        for topic in topic_names {
            self.check_delete_topic(&topic, now);
        }

        if expired_count > 0 {
            debug!(expired = expired_count, remaining = self.global_entries, "advertisement gc");
        }
    }

    /// Exponential backoff with mean [`AVG_NO_TICKET_TIMEOUT`], capped at
    /// one hundred times the mean.
    fn no_ticket_timeout(&mut self) -> Duration {
        let mut e = -(1.0 - self.rng.gen::<f64>()).ln();
        if e > 100.0 {
            e = 100.0;
        }
        Duration::from_nanos((AVG_NO_TICKET_TIMEOUT.as_nanos() as f64 * e) as u64)
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let by_topic: usize = self.topics.values().map(|t| t.entries.len()).sum();
        let by_node: usize = self.nodes.values().map(|n| n.entries.len()).sum();
        assert_eq!(self.global_entries, by_topic);
        assert_eq!(self.global_entries, by_node);
        assert!(self.global_entries <= MAX_ENTRIES);
        for info in self.topics.values() {
            assert!(info.entries.len() <= MAX_ENTRIES_PER_TOPIC);
        }
    }
}

// ============================================================================
// Wait Control Loop
// ============================================================================

/// Per-topic regulator of the advertised wait period.
///
/// On each registration at time `tm` with `period = tm − last_incoming`:
///
/// `wait_period ← max(MIN_WAIT_PERIOD, wait_period · exp((target − period) / time_const))`
///
/// Registrations arriving faster than the target grow the period
/// exponentially; a quiet topic decays back to the floor. Zero
/// initialization is fine: the first registration clamps to the floor.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitControlLoop {
    last_incoming: AbsTime,
    /// Current advertised wait period in nanoseconds.
    wait_period: u64,
}

impl WaitControlLoop {
    pub fn registered(&mut self, tm: AbsTime) {
        self.wait_period = self.next_wait_period(tm);
        self.last_incoming = tm;
    }

    fn next_wait_period(&self, tm: AbsTime) -> u64 {
        let period = tm.saturating_since(self.last_incoming) as f64;
        let target = WC_TARGET_REG_INTERVAL.as_nanos() as f64;
        let time_const = WC_TIME_CONST.as_nanos() as f64;
        let wp = (self.wait_period as f64 * ((target - period) / time_const).exp()) as u64;
        wp.max(MIN_WAIT_PERIOD.as_nanos() as u64)
    }

    /// Whether the predicted next wait period has decayed to the floor; only
    /// then may an empty topic record be dropped.
    pub fn has_minimum_wait_period(&self, now: AbsTime) -> bool {
        self.next_wait_period(now) == MIN_WAIT_PERIOD.as_nanos() as u64
    }

    pub fn wait_period(&self) -> Duration {
        Duration::from_nanos(self.wait_period)
    }
}

// ============================================================================
// Request Priority Queue
// ============================================================================

/// Min-heap of non-empty topics keyed by request priority, with an index
/// back-reference per topic for O(log n) priority updates. The minimum is
/// the least recently requested topic, the next global eviction victim.
struct RequestQueue {
    items: Vec<(u64, Topic)>,
    pos: HashMap<Topic, usize>,
}

impl RequestQueue {
    fn new() -> Self {
        RequestQueue { items: Vec::new(), pos: HashMap::new() }
    }

    fn contains(&self, topic: &Topic) -> bool {
        self.pos.contains_key(topic)
    }

    fn peek_min(&self) -> Option<&Topic> {
        self.items.first().map(|(_, topic)| topic)
    }

    fn push(&mut self, topic: Topic, priority: u64) {
        debug_assert!(!self.pos.contains_key(&topic));
        let idx = self.items.len();
        self.pos.insert(topic.clone(), idx);
        self.items.push((priority, topic));
        self.sift_up(idx);
    }

    fn update(&mut self, topic: &Topic, priority: u64) {
        if let Some(&idx) = self.pos.get(topic) {
            self.items[idx].0 = priority;
            // Priorities only grow, so the item can only move down.
            self.sift_down(idx);
        }
    }

    fn remove(&mut self, topic: &Topic) {
        let Some(idx) = self.pos.remove(topic) else {
            return;
        };
        let last = self.items.len() - 1;
        self.items.swap_remove(idx);
        if idx <= last && idx < self.items.len() {
            self.pos.insert(self.items[idx].1.clone(), idx);
            self.sift_down(idx);
            self.sift_up(idx);
        }
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.items[idx].0 >= self.items[parent].0 {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut smallest = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.items.len() && self.items[child].0 < self.items[smallest].0 {
                    smallest = child;
                }
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.pos.insert(self.items[a].1.clone(), a);
        self.pos.insert(self.items[b].1.clone(), b);
    }
}
