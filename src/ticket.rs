//! # Ticket Store and Topic Radius (client role)
//!
//! A node that wants to be found under a set of topics collects signed
//! tickets from candidate servers and schedules which ticket to present
//! where and when, so the node ends up registered under all its topics
//! without flooding any single server.
//!
//! Two adaptive mechanisms steer collection:
//!
//! - [`TopicRadius`]: a per-topic neighborhood in 64-bit ID-prefix space
//!   around the topic's hash prefix. Lookup targets are drawn alternately
//!   from inside the radius and from the ring just outside it; each ticket
//!   received nudges the radius by a bang-bang step until the expected
//!   registration wait sits near the ten-minute target.
//! - **Minimum radius**: a global moving average of the distance between
//!   lookup targets and the nearest node actually found, preventing any
//!   topic radius from shrinking below the network's real granularity.
//!
//! Tickets are indexed by the minute bucket of their registration time.
//! A ticket covering several topics is referenced once per topic;
//! `ref_cnt` tracks live references and the ticket is dropped when the
//! last one is consumed.
//!
//! `TicketStore` is a single-owner state machine, serialized by its owning
//! event loop.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{bail, Result};
use lru::LruCache;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::clock::{AbsTime, Clock, TimeBucket};
use crate::identity::{prefix_distance, Hash, NodeId, NodeRecord, Topic};

/// Number of time buckets forming the ticket coverage window.
const TIME_WINDOW: u64 = 30;

/// Base of the keep-ticket admission threshold.
const KEEP_TICKET_CONST: Duration = Duration::from_secs(10 * 60);

/// Exponentially distributed slack added to the keep-ticket threshold.
const KEEP_TICKET_EXP: Duration = Duration::from_secs(5 * 60);

/// Upper bound of the radius, covering the whole prefix space.
pub const MAX_RADIUS: u64 = u64::MAX;

/// Window length of the minimum-radius moving average.
const MIN_RAD_AVERAGE: usize = 100;

/// Samples before the minimum-radius estimate is considered stable.
const MIN_RAD_STABLE_AFTER: u64 = 50;

/// Registration wait the radius adjustment steers toward.
const TARGET_WAIT_TIME: Duration = Duration::from_secs(10 * 60);

/// Radius step magnitude once a topic has converged.
const ADJUST_RATIO: f64 = 0.002;

/// Initial radius step magnitude; decays toward [`ADJUST_RATIO`].
const ADJUST_COOLDOWN_START: f64 = 0.1;

/// Relative cooldown decay per outward (or pinned-at-minimum) step.
const ADJUST_COOLDOWN_STEP: f64 = 0.01;

/// Outer ring factor: targets are also drawn from `[radius, radius*ratio)`.
const RADIUS_EXTEND_RATIO: f64 = 1.5;

/// Bound on the per-node last-request table. Entries are only needed for
/// the round-trip of one lookup; LRU eviction caps adversarial growth.
const MAX_TRACKED_REQUESTS: usize = 1024;

/// A server-issued registration authorization covering one or more topics.
///
/// `reg_time[i]` is the local absolute time from which the ticket can be
/// presented for `topics[i]`.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub topics: Vec<Topic>,
    pub reg_time: Vec<AbsTime>,
    pub serial: u32,
    pub issue_time: AbsTime,
    pub node: NodeRecord,
    /// Raw signed blob as received; presented back to the issuer verbatim.
    pub pong: Vec<u8>,
    ref_cnt: usize,
}

impl Ticket {
    /// Build a ticket from a server response. `wait_periods` are seconds
    /// relative to `local_time`, one per topic.
    pub fn new(
        local_time: AbsTime,
        node: NodeRecord,
        serial: u32,
        topics: Vec<Topic>,
        wait_periods: &[u32],
        pong: Vec<u8>,
    ) -> Result<Ticket> {
        if topics.len() != wait_periods.len() {
            bail!(
                "bad wait period list: got {} values, want {}",
                wait_periods.len(),
                topics.len()
            );
        }
        let reg_time = wait_periods
            .iter()
            .map(|&wp| local_time + Duration::from_secs(wp as u64))
            .collect();
        Ok(Ticket {
            topics,
            reg_time,
            serial,
            issue_time: local_time,
            node,
            pong,
            ref_cnt: 0,
        })
    }

    fn find_idx(&self, topic: &Topic) -> Option<usize> {
        self.topics.iter().position(|t| t == topic)
    }
}

/// Reference to one topic slot of a stored ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketRef {
    pub node: NodeId,
    pub idx: usize,
}

/// Target of the next ticket-collection lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInfo {
    pub target: Hash,
    pub topic: Topic,
}

struct ReqInfo {
    ping_hash: Vec<u8>,
    topic: Topic,
}

/// Client-side ticket collection and scheduling state. See module docs.
pub struct TicketStore {
    clock: Clock,
    rng: StdRng,

    /// Radius detector and target generator, for searched and registered
    /// topics alike.
    radius: HashMap<Topic, TopicRadius>,

    /// Per registered topic: tickets usable in each minute bucket.
    tickets: HashMap<Topic, HashMap<TimeBucket, Vec<TicketRef>>>,
    /// Round-robin drain list over the registered topics.
    reg_topics: Vec<Topic>,
    /// Ticket owner map; a node is present iff its ticket has live refs.
    nodes: HashMap<NodeId, Ticket>,
    /// Ping hash of the last request sent to each node.
    node_last_req: LruCache<NodeId, ReqInfo>,

    last_bucket_fetched: TimeBucket,
    next_ticket_cached: Option<TicketRef>,

    min_rad_cnt: u64,
    min_rad_ptr: usize,
    min_radius: u64,
    min_rad_sum: u64,
    last_min_rads: [u64; MIN_RAD_AVERAGE],
}

impl TicketStore {
    pub fn new(clock: Clock) -> Self {
        Self::with_rng(clock, StdRng::from_entropy())
    }

    pub fn with_rng(clock: Clock, rng: StdRng) -> Self {
        TicketStore {
            clock,
            rng,
            radius: HashMap::new(),
            tickets: HashMap::new(),
            reg_topics: Vec::new(),
            nodes: HashMap::new(),
            node_last_req: LruCache::new(NonZeroUsize::new(MAX_TRACKED_REQUESTS).unwrap()),
            last_bucket_fetched: TimeBucket(0),
            next_ticket_cached: None,
            min_rad_cnt: 0,
            min_rad_ptr: 0,
            min_radius: 0,
            min_rad_sum: 0,
            last_min_rads: [0; MIN_RAD_AVERAGE],
        }
    }

    /// Start tracking a topic. With `register` set, tickets are collected
    /// so the local node gets advertised; otherwise the topic is only
    /// searched and just the radius is maintained.
    pub fn add_topic(&mut self, topic: Topic, register: bool) {
        trace!(topic = %topic, register, "tracking topic");
        self.radius
            .entry(topic.clone())
            .or_insert_with(|| TopicRadius::new(&topic));
        if register {
            self.tickets.entry(topic).or_default();
        }
    }

    /// Stop registering a topic, dropping every queued ticket reference.
    pub fn remove_register_topic(&mut self, topic: &Topic) {
        trace!(topic = %topic, "dropping registered topic");
        let Some(queue) = self.tickets.remove(topic) else {
            return;
        };
        for (_, list) in queue {
            for r in list {
                self.unref(r);
            }
        }
        self.next_ticket_cached = None;
    }

    /// The set of topics currently being registered, in arbitrary order.
    pub fn reg_topic_set(&self) -> Vec<Topic> {
        self.tickets.keys().cloned().collect()
    }

    /// Target of the next lookup for ticket collection: the next topic
    /// (round-robin) whose coverage estimator wants more tickets. When all
    /// topics are satisfied there is nothing to look up and the caller
    /// should retry after the longer idle delay.
    pub fn next_register_lookup(&mut self) -> (Option<LookupInfo>, Duration) {
        if let Some(first) = self.iter_reg_topics() {
            let mut topic = first.clone();
            loop {
                if self.tickets.contains_key(&topic) && self.need_more_tickets(&topic) {
                    let target = self
                        .radius
                        .get_mut(&topic)
                        .expect("registered topic has a radius")
                        .next_target(&mut self.rng);
                    trace!(topic = %topic, target = %target, "next register lookup");
                    return (Some(LookupInfo { target, topic }), Duration::from_secs(1));
                }
                match self.iter_reg_topics() {
                    Some(next) if next != first => topic = next,
                    _ => break,
                }
            }
        }
        (None, Duration::from_secs(40))
    }

    /// Round-robin over the registered topics, refilling the drain list
    /// when exhausted.
    fn iter_reg_topics(&mut self) -> Option<Topic> {
        if self.reg_topics.is_empty() {
            if self.tickets.is_empty() {
                return None;
            }
            self.reg_topics.extend(self.tickets.keys().cloned());
        }
        self.reg_topics.pop()
    }

    /// Coverage estimator: each ticket queued in the next [`TIME_WINDOW`]
    /// buckets contributes inversely to its wait length, so long-wait
    /// tickets are cheap and many are needed. More tickets are wanted while
    /// the sum stays below 10.
    pub fn need_more_tickets(&self, topic: &Topic) -> bool {
        let Some(queue) = self.tickets.get(topic) else {
            return false;
        };
        let now = self.clock.now();
        let window_len = crate::clock::TIME_BUCKET_LEN.as_nanos() as u64 * TIME_WINDOW;
        let mut sum = 0.0;
        let start = now.bucket();
        for offset in 0..TIME_WINDOW {
            let Some(list) = queue.get(&(start + offset)) else {
                continue;
            };
            for &r in list {
                let ticket = &self.nodes[&r.node];
                let wait = ticket.reg_time[r.idx]
                    .saturating_since(ticket.issue_time)
                    .clamp(crate::clock::TIME_BUCKET_LEN.as_nanos() as u64, window_len);
                sum += TARGET_WAIT_TIME.as_nanos() as f64 / wait as f64;
            }
        }
        sum < 10.0
    }

    /// The queued ticket with the earliest registration time, plus the
    /// signed nanoseconds until it becomes usable (non-positive: usable
    /// now). `None` when nothing is queued. A ticket covering several
    /// topics is returned once per pending topic.
    pub fn next_registerable_ticket(&mut self) -> Option<(TicketRef, i64)> {
        let now = self.clock.now();
        if let Some(r) = self.next_ticket_cached {
            return Some((r, self.reg_time_of(r).nanos_until(now)));
        }

        let mut bucket = self.last_bucket_fetched;
        loop {
            let mut empty = true;
            let mut next: Option<TicketRef> = None;
            for queue in self.tickets.values() {
                if queue.is_empty() {
                    continue;
                }
                empty = false;
                if let Some(list) = queue.get(&bucket) {
                    for &r in list {
                        if next.map_or(true, |n| self.reg_time_of(r) < self.reg_time_of(n)) {
                            next = Some(r);
                        }
                    }
                }
            }
            if empty {
                return None;
            }
            if let Some(r) = next {
                self.next_ticket_cached = Some(r);
                return Some((r, self.reg_time_of(r).nanos_until(now)));
            }
            self.last_bucket_fetched = bucket;
            bucket = bucket.next();
        }
    }

    /// Consume one `(topic, bucket)` reference after the ticket has been
    /// presented for that topic. The last consumed reference drops the
    /// ticket entirely.
    pub fn ticket_registered(&mut self, r: TicketRef) {
        let (topic, bucket) = {
            let ticket = &self.nodes[&r.node];
            (ticket.topics[r.idx].clone(), ticket.reg_time[r.idx].bucket())
        };
        let Some(queue) = self.tickets.get_mut(&topic) else {
            return;
        };
        let list = queue.get_mut(&bucket).map(|l| {
            let idx = l
                .iter()
                .position(|b| b.node == r.node)
                .expect("ticket reference present in its bucket");
            l.swap_remove(idx);
            l.len()
        });
        match list {
            Some(0) => {
                queue.remove(&bucket);
            }
            Some(_) => {}
            // Bucket index derived from the ticket itself; its absence is an
            // internal inconsistency.
            None => panic!("ticket bucket missing for registered ticket"),
        }
        self.unref(r);
        self.next_ticket_cached = None;
    }

    /// Process the result of a ticket-collection lookup: feed the
    /// min-radius estimator, re-adjust radii for nodes whose ticket is
    /// already held, and ping new candidates (closest node always, others
    /// only inside the minimum radius).
    pub fn register_lookup_done(
        &mut self,
        lookup: &LookupInfo,
        found: &[NodeRecord],
        mut ping: impl FnMut(&NodeRecord) -> Vec<u8>,
    ) {
        if let Some(closest) = found.first() {
            self.adjust_min_radius(lookup.target, closest.id);
        }
        for (i, node) in found.iter().enumerate() {
            if i == 0
                || prefix_distance(node.id.prefix(), lookup.target.prefix()) < self.min_radius
            {
                if let Some(ticket) = self.nodes.get(&node.id).cloned() {
                    // Radius feedback from the stored ticket; no new request.
                    if let Some(idx) = ticket.find_idx(&lookup.topic) {
                        self.adjust_with_ticket(&ticket, Some(idx), false);
                    }
                } else {
                    let ping_hash = ping(node);
                    self.node_last_req
                        .put(node.id, ReqInfo { ping_hash, topic: lookup.topic.clone() });
                }
            }
        }
    }

    /// Admit a ticket that arrived in a pong from `node`.
    ///
    /// Tickets that do not answer our last ping to the node still inform
    /// radius adjustment of their not-yet-converged topics, then drop. An
    /// answering ticket is queued for every topic that is in radius,
    /// undersupplied, converged, and whose remaining wait passes the
    /// keep-ticket threshold.
    pub fn add_ticket(&mut self, ping_hash: &[u8], ticket: Ticket) {
        let now = self.clock.now();
        trace!(node = %ticket.node.id, serial = ticket.serial, "ticket received");

        if self.nodes.contains_key(&ticket.node.id) {
            return;
        }

        let answers_request = self
            .node_last_req
            .peek(&ticket.node.id)
            .map_or(false, |req| req.ping_hash == ping_hash);
        if !answers_request {
            self.adjust_with_ticket(&ticket, None, true);
            return;
        }
        let req_topic = self
            .node_last_req
            .peek(&ticket.node.id)
            .map(|req| req.topic.clone())
            .unwrap();
        let Some(req_idx) = ticket.find_idx(&req_topic) else {
            return;
        };

        self.adjust_with_ticket(&ticket, Some(req_idx), false);
        let bucket = now.bucket();
        if self.last_bucket_fetched == TimeBucket(0) || bucket < self.last_bucket_fetched {
            self.last_bucket_fetched = bucket;
        }

        let mut ticket = ticket;
        for idx in 0..ticket.topics.len() {
            let topic = ticket.topics[idx].clone();
            let in_radius = self
                .radius
                .get(&topic)
                .map_or(false, |r| r.is_in_radius(ticket.node.id.prefix(), false));
            if !in_radius || !self.need_more_tickets(&topic) {
                continue;
            }
            let converged = self.radius[&topic].converged;
            if !converged || !self.tickets.contains_key(&topic) {
                continue;
            }
            let wait = ticket.reg_time[idx].saturating_since(now);
            let rnd = exp_variate(&mut self.rng).min(10.0);
            let keep = KEEP_TICKET_CONST.as_nanos() as f64
                + KEEP_TICKET_EXP.as_nanos() as f64 * rnd;
            if (wait as f64) < keep {
                let reg_bucket = ticket.reg_time[idx].bucket();
                self.tickets
                    .get_mut(&topic)
                    .unwrap()
                    .entry(reg_bucket)
                    .or_default()
                    .push(TicketRef { node: ticket.node.id, idx });
                ticket.ref_cnt += 1;
            }
        }

        if ticket.ref_cnt > 0 {
            debug!(node = %ticket.node.id, refs = ticket.ref_cnt, "ticket queued");
            self.next_ticket_cached = None;
            self.nodes.insert(ticket.node.id, ticket);
        }
    }

    /// The stored ticket from `node`, if any reference to it is live.
    pub fn get_node_ticket(&self, node: &NodeId) -> Option<&Ticket> {
        self.nodes.get(node)
    }

    /// Current global minimum radius estimate.
    pub fn min_radius(&self) -> u64 {
        self.min_radius
    }

    fn adjust_with_ticket(&mut self, ticket: &Ticket, idx: Option<usize>, only_converging: bool) {
        let min_radius = self.min_radius;
        let stable = self.min_rad_cnt >= MIN_RAD_STABLE_AFTER;
        let node_prefix = ticket.node.id.prefix();

        if only_converging {
            for (i, topic) in ticket.topics.iter().enumerate() {
                if let Some(r) = self.radius.get_mut(topic) {
                    if !r.converged && r.is_in_radius(node_prefix, true) {
                        r.adjust(ticket, i, min_radius, stable);
                    }
                }
            }
        } else if let Some(idx) = idx {
            if let Some(r) = self.radius.get_mut(&ticket.topics[idx]) {
                if r.is_in_radius(node_prefix, true) {
                    r.adjust(ticket, idx, min_radius, stable);
                }
            }
        }
    }

    /// Update the global minimum radius from one lookup outcome: the
    /// prefix distance between the target and the closest node found,
    /// averaged over the last [`MIN_RAD_AVERAGE`] lookups.
    fn adjust_min_radius(&mut self, target: Hash, found: NodeId) {
        let dist = prefix_distance(target.prefix(), found.prefix());
        let mr = if dist < MAX_RADIUS / 16 { dist * 16 } else { MAX_RADIUS } / MIN_RAD_AVERAGE as u64;

        self.min_rad_sum -= self.last_min_rads[self.min_rad_ptr];
        self.last_min_rads[self.min_rad_ptr] = mr;
        self.min_rad_sum += mr;
        self.min_rad_ptr = (self.min_rad_ptr + 1) % MIN_RAD_AVERAGE;
        self.min_rad_cnt += 1;

        self.min_radius = if self.min_rad_cnt < MIN_RAD_AVERAGE as u64 {
            (self.min_rad_sum / self.min_rad_cnt) * MIN_RAD_AVERAGE as u64
        } else {
            self.min_rad_sum
        };
    }

    fn unref(&mut self, r: TicketRef) {
        if let Some(ticket) = self.nodes.get_mut(&r.node) {
            ticket.ref_cnt -= 1;
            if ticket.ref_cnt == 0 {
                self.nodes.remove(&r.node);
                self.node_last_req.pop(&r.node);
            }
        }
    }

    fn reg_time_of(&self, r: TicketRef) -> AbsTime {
        self.nodes[&r.node].reg_time[r.idx]
    }

    #[cfg(test)]
    fn assert_ref_invariant(&self) {
        let mut counted: HashMap<NodeId, usize> = HashMap::new();
        for queue in self.tickets.values() {
            for list in queue.values() {
                for r in list {
                    *counted.entry(r.node).or_default() += 1;
                    // bucket index matches the referenced registration time
                    let bucket = self.nodes[&r.node].reg_time[r.idx].bucket();
                    assert!(queue[&bucket].iter().any(|b| b == r));
                }
            }
        }
        for (node, ticket) in &self.nodes {
            assert_eq!(counted.get(node).copied().unwrap_or(0), ticket.ref_cnt);
            assert!(ticket.ref_cnt > 0);
        }
        assert_eq!(counted.len(), self.nodes.len());
    }
}

// ============================================================================
// Topic Radius
// ============================================================================

/// Adaptive per-topic neighborhood in prefix space. See module docs for the
/// control law.
pub struct TopicRadius {
    topic_hash_prefix: u64,
    radius: u64,
    /// Step magnitude while converging; decays toward [`ADJUST_RATIO`].
    adjust_cooldown: f64,
    converged: bool,
    /// Balance between inner-region and outer-ring sampling, kept near
    /// zero so the lookup beam explores both sides of the boundary.
    int_ext_balance: f64,
}

impl TopicRadius {
    pub fn new(topic: &Topic) -> Self {
        TopicRadius {
            topic_hash_prefix: topic.prefix(),
            radius: MAX_RADIUS,
            adjust_cooldown: ADJUST_COOLDOWN_START,
            converged: false,
            int_ext_balance: 0.0,
        }
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn radius(&self) -> u64 {
        self.radius
    }

    /// Whether a node lies inside the radius (or the extended ring).
    fn is_in_radius(&self, node_prefix: u64, ext_radius: bool) -> bool {
        let dist = prefix_distance(node_prefix, self.topic_hash_prefix);
        if ext_radius {
            (dist as f64) < self.radius as f64 * RADIUS_EXTEND_RATIO
        } else {
            dist < self.radius
        }
    }

    /// A fresh random lookup target: inside the radius when the balance
    /// leans external, otherwise in the ring just outside it.
    pub fn next_target(&mut self, rng: &mut StdRng) -> Hash {
        let rnd = if self.int_ext_balance < 0.0 {
            rand_u64_below(rng, self.radius)
        } else {
            let ext = (self.radius as f64 * RADIUS_EXTEND_RATIO).min(MAX_RADIUS as f64) as u64;
            self.radius + rand_u64_below(rng, ext - self.radius)
        };
        Hash::from_prefix(self.topic_hash_prefix ^ rnd)
    }

    /// One bang-bang radius step from a received ticket: grow when the
    /// advertised wait exceeds the target, shrink otherwise; magnitude is
    /// the cooldown until converged, then [`ADJUST_RATIO`].
    fn adjust(&mut self, ticket: &Ticket, idx: usize, min_radius: u64, min_rad_stable: bool) {
        let (balance_step, step_sign) = if self.is_in_radius(ticket.node.id.prefix(), false) {
            (RADIUS_EXTEND_RATIO - 1.0, 1.0)
        } else {
            (-1.0, -1.0)
        };
        // Sampling leaning too far to one side is ignored until the other
        // side catches up; the balance may overshoot the bound by one step.
        if self.int_ext_balance * step_sign > 3.0 {
            return;
        }
        self.int_ext_balance += balance_step;

        let wait = ticket.reg_time[idx].saturating_since(ticket.issue_time);
        let mut adjust = if wait > TARGET_WAIT_TIME.as_nanos() as u64 { 1.0 } else { -1.0 };
        adjust *= if self.converged { ADJUST_RATIO } else { self.adjust_cooldown };

        let radius = self.radius as f64 * (1.0 + adjust);
        if radius > MAX_RADIUS as f64 {
            self.radius = MAX_RADIUS;
        } else {
            self.radius = (radius as u64).max(min_radius);
        }

        if !self.converged && (adjust > 0.0 || (self.radius == min_radius && min_rad_stable)) {
            self.adjust_cooldown *= 1.0 - ADJUST_COOLDOWN_STEP;
            if self.adjust_cooldown <= ADJUST_RATIO {
                debug!(prefix = format_args!("{:016x}", self.topic_hash_prefix), "topic radius converged");
                self.converged = true;
            }
        }
    }
}

/// Uniform even value below `n`; 63 bits of randomness suffice here.
fn rand_u64_below(rng: &mut StdRng, n: u64) -> u64 {
    if n < 4 {
        return 0;
    }
    rng.gen_range(0..n / 2) * 2
}

/// Standard exponential variate (mean 1) by inverse transform.
fn exp_variate(rng: &mut StdRng) -> f64 {
    -(1.0 - rng.gen::<f64>()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn make_store() -> (TicketStore, Arc<ManualClock>) {
        // Start well past bucket zero so the sentinel never aliases.
        let clock = Arc::new(ManualClock::new(AbsTime::ZERO + Duration::from_secs(600)));
        let store = TicketStore::with_rng(clock.clone(), StdRng::seed_from_u64(99));
        (store, clock)
    }

    /// A node whose prefix distance to `topic` is exactly `dist`, made
    /// unique by a salt in the low bytes.
    fn node_at(topic: &Topic, dist: u64, salt: u32) -> NodeRecord {
        let mut bytes = *Hash::from_prefix(topic.prefix() ^ dist).as_bytes();
        bytes[24..28].copy_from_slice(&salt.to_be_bytes());
        NodeRecord::new(Hash::from_bytes(bytes), "127.0.0.1:30303".parse().unwrap())
    }

    fn make_ticket(
        store: &TicketStore,
        node: NodeRecord,
        serial: u32,
        topics: &[Topic],
        wait_secs: u32,
    ) -> Ticket {
        let now = store.clock.now();
        Ticket::new(
            now,
            node,
            serial,
            topics.to_vec(),
            &vec![wait_secs; topics.len()],
            b"pong".to_vec(),
        )
        .unwrap()
    }

    /// Route a ticket through the lookup-then-ping flow so the store
    /// accepts it as an answer to its own request.
    fn deliver(store: &mut TicketStore, topic: &Topic, ticket: Ticket) {
        let lookup = LookupInfo { target: Hash::from_prefix(topic.prefix()), topic: topic.clone() };
        store.register_lookup_done(&lookup, &[ticket.node.clone()], |_| b"ping-hash".to_vec());
        store.add_ticket(b"ping-hash", ticket);
    }

    fn force_converged(store: &mut TicketStore, topic: &Topic) {
        let r = store.radius.get_mut(topic).unwrap();
        r.adjust_cooldown = ADJUST_RATIO;
        r.converged = true;
    }

    #[test]
    fn ticket_length_mismatch_is_rejected() {
        let (store, _clock) = make_store();
        let topic = Topic::from("t");
        let res = Ticket::new(
            store.clock.now(),
            node_at(&topic, 0, 1),
            1,
            vec![topic],
            &[5, 6],
            Vec::new(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn queued_ticket_tracks_references() {
        let (mut store, _clock) = make_store();
        let t1 = Topic::from("alpha");
        let t2 = Topic::from("beta");
        store.add_topic(t1.clone(), true);
        store.add_topic(t2.clone(), true);
        force_converged(&mut store, &t1);
        force_converged(&mut store, &t2);

        // One ticket covering both topics; node inside both radii.
        let node = node_at(&t1, 0, 1);
        let ticket = make_ticket(&store, node.clone(), 1, &[t1.clone(), t2.clone()], 300);
        deliver(&mut store, &t1, ticket);

        let stored = store.get_node_ticket(&node.id).unwrap();
        assert_eq!(stored.ref_cnt, 2);
        store.assert_ref_invariant();

        // Consume both references; the ticket disappears with the last one.
        let (r1, wait) = store.next_registerable_ticket().unwrap();
        assert!(wait > 0);
        store.ticket_registered(r1);
        assert!(store.get_node_ticket(&node.id).is_some());
        store.assert_ref_invariant();

        let (r2, _) = store.next_registerable_ticket().unwrap();
        assert_ne!(r1.idx, r2.idx);
        store.ticket_registered(r2);
        assert!(store.get_node_ticket(&node.id).is_none());
        assert!(store.next_registerable_ticket().is_none());
        store.assert_ref_invariant();
    }

    #[test]
    fn duplicate_and_unsolicited_tickets_are_dropped() {
        let (mut store, _clock) = make_store();
        let topic = Topic::from("gamma");
        store.add_topic(topic.clone(), true);
        force_converged(&mut store, &topic);

        let node = node_at(&topic, 0, 2);
        let ticket = make_ticket(&store, node.clone(), 1, &[topic.clone()], 300);

        // Unsolicited: no recorded ping, must not be queued.
        store.add_ticket(b"whatever", ticket.clone());
        assert!(store.get_node_ticket(&node.id).is_none());

        deliver(&mut store, &topic, ticket.clone());
        assert!(store.get_node_ticket(&node.id).is_some());

        // Second arrival from the same node is ignored.
        let dup = make_ticket(&store, node.clone(), 2, &[topic.clone()], 500);
        store.add_ticket(b"ping-hash", dup);
        assert_eq!(store.get_node_ticket(&node.id).unwrap().serial, 1);
        store.assert_ref_invariant();
    }

    #[test]
    fn remove_register_topic_unwinds_references() {
        let (mut store, _clock) = make_store();
        let topic = Topic::from("delta");
        store.add_topic(topic.clone(), true);
        force_converged(&mut store, &topic);

        for salt in 0..3 {
            let node = node_at(&topic, salt as u64, salt);
            let ticket = make_ticket(&store, node, salt + 1, &[topic.clone()], 120 + salt);
            deliver(&mut store, &topic, ticket);
        }
        assert_eq!(store.nodes.len(), 3);

        store.remove_register_topic(&topic);
        assert!(store.nodes.is_empty());
        assert!(store.next_registerable_ticket().is_none());
        store.assert_ref_invariant();
    }

    #[test]
    fn earliest_registration_time_wins() {
        let (mut store, _clock) = make_store();
        let topic = Topic::from("epsilon");
        store.add_topic(topic.clone(), true);
        force_converged(&mut store, &topic);

        let late = node_at(&topic, 1, 1);
        let early = node_at(&topic, 2, 2);
        let t_late = make_ticket(&store, late.clone(), 1, &[topic.clone()], 600);
        let t_early = make_ticket(&store, early.clone(), 1, &[topic.clone()], 90);
        deliver(&mut store, &topic, t_late);
        deliver(&mut store, &topic, t_early);

        let (r, _) = store.next_registerable_ticket().unwrap();
        assert_eq!(r.node, early.id);
        store.assert_ref_invariant();
    }

    #[test]
    fn coverage_estimator_saturates() {
        let (mut store, _clock) = make_store();
        let topic = Topic::from("zeta");
        store.add_topic(topic.clone(), true);
        force_converged(&mut store, &topic);
        assert!(store.need_more_tickets(&topic));

        // Short-wait tickets contribute targetWaitTime / 1min = 10 each, so
        // a single one saturates the estimator.
        let node = node_at(&topic, 3, 7);
        let ticket = make_ticket(&store, node, 1, &[topic.clone()], 30);
        deliver(&mut store, &topic, ticket);
        assert!(!store.need_more_tickets(&topic));

        // And further tickets are refused outright.
        let other = node_at(&topic, 4, 8);
        let refused = make_ticket(&store, other.clone(), 1, &[topic.clone()], 30);
        deliver(&mut store, &topic, refused);
        assert!(store.get_node_ticket(&other.id).is_none());
    }

    #[test]
    fn lookup_schedule_idles_when_satisfied() {
        let (mut store, _clock) = make_store();
        let (none, delay) = store.next_register_lookup();
        assert!(none.is_none());
        assert_eq!(delay, Duration::from_secs(40));

        let topic = Topic::from("eta");
        store.add_topic(topic.clone(), true);
        let (lookup, delay) = store.next_register_lookup();
        assert_eq!(lookup.unwrap().topic, topic);
        assert_eq!(delay, Duration::from_secs(1));

        // Saturate the topic; the scheduler falls back to the idle delay.
        force_converged(&mut store, &topic);
        let node = node_at(&topic, 5, 1);
        let ticket = make_ticket(&store, node, 1, &[topic.clone()], 30);
        deliver(&mut store, &topic, ticket);
        let (none, delay) = store.next_register_lookup();
        assert!(none.is_none());
        assert_eq!(delay, Duration::from_secs(40));
    }

    #[test]
    fn known_nodes_are_not_pinged_again() {
        let (mut store, _clock) = make_store();
        let topic = Topic::from("theta");
        store.add_topic(topic.clone(), true);
        force_converged(&mut store, &topic);

        let node = node_at(&topic, 6, 1);
        let ticket = make_ticket(&store, node.clone(), 1, &[topic.clone()], 300);
        deliver(&mut store, &topic, ticket);

        let mut pings = 0;
        let lookup = LookupInfo { target: Hash::from_prefix(topic.prefix()), topic: topic.clone() };
        store.register_lookup_done(&lookup, &[node], |_| {
            pings += 1;
            Vec::new()
        });
        assert_eq!(pings, 0);
    }

    #[test]
    fn min_radius_follows_lookup_outcomes() {
        let (mut store, _clock) = make_store();
        let target = Hash::from_prefix(0);
        let dist = 1u64 << 20;
        let found = Hash::from_prefix(dist);
        for _ in 0..MIN_RAD_AVERAGE {
            store.adjust_min_radius(target, found);
        }
        // All samples equal: the average is the per-sample contribution
        // restored to full scale.
        assert_eq!(store.min_radius(), (dist * 16 / MIN_RAD_AVERAGE as u64) * MIN_RAD_AVERAGE as u64);

        // A huge distance saturates at the full prefix space.
        for _ in 0..MIN_RAD_AVERAGE {
            store.adjust_min_radius(target, Hash::from_prefix(u64::MAX));
        }
        assert_eq!(store.min_radius(), (MAX_RADIUS / MIN_RAD_AVERAGE as u64) * MIN_RAD_AVERAGE as u64);
    }

    #[test]
    fn next_target_respects_balance_regions() {
        let (mut store, _clock) = make_store();
        let topic = Topic::from("iota");
        store.add_topic(topic.clone(), true);
        let mut rng = StdRng::seed_from_u64(3);

        let r = store.radius.get_mut(&topic).unwrap();
        r.radius = 1 << 32;

        r.int_ext_balance = -1.0;
        for _ in 0..50 {
            let target = r.next_target(&mut rng);
            let dist = prefix_distance(target.prefix(), topic.prefix());
            assert!(dist < r.radius);
        }

        r.int_ext_balance = 1.0;
        for _ in 0..50 {
            let target = r.next_target(&mut rng);
            let dist = prefix_distance(target.prefix(), topic.prefix());
            assert!(dist >= r.radius);
            assert!((dist as f64) < r.radius as f64 * RADIUS_EXTEND_RATIO);
        }
    }

    #[test]
    fn radius_converges_after_cooldown_decay() {
        let (store, _clock) = make_store();
        let topic = Topic::from("kappa");
        let mut radius = TopicRadius::new(&topic);

        // Tickets advertising waits above the target push the radius
        // outward; each applied step decays the cooldown by 1%. Interleave
        // inner and outer samples to keep the balance inside its band.
        let inner = node_at(&topic, 10, 1);
        let outer = node_at(&topic, u64::MAX, 2); // complement prefix, never in radius
        let long_wait = 15 * 60; // above the 10 min target

        let mut applied = 0u32;
        let mut i = 0u64;
        while !radius.converged {
            let node = if i % 3 == 2 { outer.clone() } else { inner.clone() };
            let ticket = make_ticket(&store, node, 1, &[topic.clone()], long_wait);
            let before = radius.adjust_cooldown;
            radius.adjust(&ticket, 0, 0, false);
            if radius.adjust_cooldown < before {
                applied += 1;
            }
            i += 1;
            assert!(i < 2000, "radius failed to converge");
        }
        // 0.1 * 0.99^n <= 0.002 first holds at n = 390.
        assert_eq!(applied, 390);
        assert_eq!(radius.radius(), MAX_RADIUS);
    }
}
