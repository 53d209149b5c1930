//! End-to-end advertisement pipeline: ticket issue on the server side,
//! collection and scheduling on the client side, registration, visibility,
//! backoff and expiry. All timing runs on a shared hand-driven clock.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use lumen::{
    hash_of, prefix_distance, AbsTime, Hash, LookupInfo, ManualClock, MemoryDb, NodeDb,
    NodeRecord, Ticket, TicketStore, TimeSource, Topic, TopicTable,
};

const HOUR: Duration = Duration::from_secs(3600);

/// Route crate tracing through the test harness when RUST_LOG is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node_with_prefix(prefix: u64, salt: u32) -> NodeRecord {
    let mut bytes = *Hash::from_prefix(prefix).as_bytes();
    bytes[28..32].copy_from_slice(&salt.to_be_bytes());
    NodeRecord::new(Hash::from_bytes(bytes), "10.1.0.1:30303".parse().unwrap())
}

#[test]
fn ticket_round_trip_registers_and_expires() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(AbsTime::from_nanos(0) + Duration::from_secs(600)));
    let db = NodeDb::new(Arc::new(MemoryDb::new()));
    let mut table = TopicTable::with_rng(db, clock.clone(), StdRng::seed_from_u64(42));

    let topics = [Topic::from("les.mainnet"), Topic::from("shh.v2")];
    let registrant = NodeRecord::new(hash_of(b"registrant"), "10.0.0.2:30303".parse().unwrap());

    // The server hands out a ticket naming a wait period per topic.
    let issued = table.get_ticket(&registrant, &topics).unwrap();
    assert_eq!(issued.wait_until.len(), 2);

    // Presenting it early gets nothing registered.
    assert!(!table.use_ticket(&registrant, issued.serial, &topics, &issued.wait_until, HOUR));

    // At the scheduled moment the registration is admitted for both topics.
    let max_wait = *issued.wait_until.iter().max().unwrap();
    clock.advance(Duration::from_secs((max_wait - issued.curr_time) as u64));
    assert!(table.use_ticket(&registrant, issued.serial, &topics, &issued.wait_until, HOUR));
    for topic in &topics {
        let entries = table.get_entries(topic);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, registrant.id);
    }

    // Fresh registration puts the node into no-ticket backoff.
    assert!(table.get_ticket(&registrant, &topics).is_none());

    // Replaying the very same ticket adds nothing.
    assert!(!table.use_ticket(&registrant, issued.serial, &topics, &issued.wait_until, HOUR));
    assert_eq!(table.get_entries(&topics[0]).len(), 1);

    // Entries vanish after expiry.
    clock.advance(HOUR + Duration::from_secs(120));
    assert!(table.get_entries(&topics[0]).is_empty());
    assert!(table.get_entries(&topics[1]).is_empty());
}

/// Synthetic network for the client side: nodes populate geometric shells
/// around the topic prefix, a lookup resolves to the shell nearest the
/// target's distance, and servers inside the "popular" region quote waits
/// above the ten-minute target while the rest quote short waits. The
/// client's radius should home in on the popular-region boundary and
/// converge there.
struct Network {
    topic_prefix: u64,
    shells: Vec<u64>,
    serial: u32,
}

/// Topic-distance below which the synthetic servers are busy (long waits).
const POPULAR_BOUNDARY: u64 = 1 << 44;

impl Network {
    fn new(topic: &Topic) -> Self {
        let mut shells = Vec::new();
        for j in 16..=62u32 {
            shells.push(1u64 << j);
            if j < 62 {
                shells.push((1u64 << j) + (1u64 << (j - 1)));
            }
        }
        Network { topic_prefix: topic.prefix(), shells, serial: 0 }
    }

    /// The population node whose topic distance is nearest the target's.
    fn lookup(&self, target: Hash) -> NodeRecord {
        let want = prefix_distance(target.prefix(), self.topic_prefix);
        let shell = self
            .shells
            .iter()
            .copied()
            .min_by_key(|s| s.abs_diff(want))
            .unwrap();
        node_with_prefix(self.topic_prefix ^ shell, shell as u32)
    }

    /// Issue a single-topic ticket; busy (close) servers quote waits above
    /// the target, far servers answer quickly.
    fn issue(&mut self, now: AbsTime, node: NodeRecord, topic: &Topic) -> Ticket {
        let dist = prefix_distance(node.id.prefix(), self.topic_prefix);
        let wait_secs = if dist < POPULAR_BOUNDARY { 900 } else { 90 };
        self.serial += 1;
        Ticket::new(now, node, self.serial, vec![topic.clone()], &[wait_secs], b"sig".to_vec())
            .unwrap()
    }
}

#[test]
fn client_converges_and_schedules_a_ticket() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(AbsTime::from_nanos(0) + Duration::from_secs(600)));
    let mut store = TicketStore::with_rng(clock.clone(), StdRng::seed_from_u64(7));
    let topic = Topic::from("les.mainnet");
    store.add_topic(topic.clone(), true);

    let mut network = Network::new(&topic);

    // Drive the collection loop: every received ticket adjusts the radius;
    // once the topic converges, qualifying tickets start queueing.
    let mut queued = None;
    for round in 0..20_000 {
        if let Some((ticket_ref, wait)) = store.next_registerable_ticket() {
            queued = Some((ticket_ref, wait, round));
            break;
        }
        let (lookup, delay) = store.next_register_lookup();
        clock.advance(delay);
        let Some(lookup) = lookup else { continue };
        let found = network.lookup(lookup.target);

        let mut ping_hash = None;
        store.register_lookup_done(&lookup, &[found.clone()], |n| {
            let h = hash_of(n.id.as_bytes()).as_bytes().to_vec();
            ping_hash = Some(h.clone());
            h
        });
        if let Some(hash) = ping_hash {
            let ticket = network.issue(clock.now(), found, &topic);
            store.add_ticket(&hash, ticket);
        }
    }

    let (ticket_ref, wait, round) = queued.expect("no ticket queued within 20000 rounds");
    assert!(round > 400, "converged suspiciously fast, after {round} rounds");

    // The queued ticket belongs to a tracked node and can be consumed.
    let serial = store.get_node_ticket(&ticket_ref.node).unwrap().serial;
    assert!(serial > 0);
    if wait > 0 {
        clock.advance(Duration::from_nanos(wait as u64));
    }
    store.ticket_registered(ticket_ref);
    assert!(store.get_node_ticket(&ticket_ref.node).is_none());
}

#[test]
fn search_only_topics_collect_no_tickets() {
    let clock = Arc::new(ManualClock::new(AbsTime::from_nanos(0) + Duration::from_secs(600)));
    let mut store = TicketStore::with_rng(clock.clone(), StdRng::seed_from_u64(11));
    let topic = Topic::from("bzz.swarm");
    store.add_topic(topic.clone(), false);

    // Not registering: the scheduler has nothing to look up.
    let (lookup, delay) = store.next_register_lookup();
    assert!(lookup.is_none());
    assert_eq!(delay, Duration::from_secs(40));

    // Even a well-formed solicited ticket is not queued for a search-only
    // topic.
    let node = node_with_prefix(topic.prefix(), 1);
    let lookup = LookupInfo { target: Hash::from_prefix(topic.prefix()), topic: topic.clone() };
    store.register_lookup_done(&lookup, &[node.clone()], |_| b"ph".to_vec());
    let ticket =
        Ticket::new(clock.now(), node.clone(), 1, vec![topic.clone()], &[60], Vec::new()).unwrap();
    store.add_ticket(b"ph", ticket);
    assert!(store.get_node_ticket(&node.id).is_none());
    assert!(store.next_registerable_ticket().is_none());
}
