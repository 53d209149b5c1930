//! # Light-Client Flow Control
//!
//! A full node serving light clients rate-limits each of them with a
//! token-bucket of request credits. Every client owns a buffer bounded by
//! `buf_limit` that drains by the cost of served requests and recharges at
//! `min_recharge` cost units per millisecond, plus a fair share of the
//! aggregate recharge capacity left unused by idle clients.
//!
//! Admission is reserve-then-settle: [`ClientManager::accept`] reserves the
//! advertised worst-case cost up front, [`ClientManager::processed`]
//! settles to the real cost and refunds the difference. A request whose
//! worst case exceeds the current buffer is deferred with the exact
//! recharge delay, so callers wait without busy-looping; one that can never
//! fit is refused outright.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::{AbsTime, Clock};
use crate::identity::NodeId;

/// One `min_recharge` unit of credit is recovered per this interval.
const FC_TIME_CONST: Duration = Duration::from_millis(1);

/// Flow control parameters a server advertises to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerParams {
    /// Absolute cap on a client's credit buffer.
    pub buf_limit: u64,
    /// Guaranteed recharge rate, in cost units per millisecond.
    pub min_recharge: u64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Cost reserved; the remaining buffer value is echoed to the client.
    Accepted { buf_value: u64 },
    /// Not enough credit yet; retry after the returned delay.
    Deferred { retry_in: Duration },
    /// Unknown client, stopped manager, or a cost that can never fit.
    Rejected,
}

struct ClientState {
    params: ServerParams,
    buf_value: u64,
    last_update: AbsTime,
}

struct Inner {
    clients: HashMap<NodeId, ClientState>,
    stopped: bool,
}

/// Token-bucket fairness across the connected light clients.
///
/// The manager is shared between per-peer request tasks; a single interior
/// lock serializes all accounting, satisfying the total-order contract.
pub struct ClientManager {
    /// Aggregate recharge capacity, in cost units per millisecond.
    total_recharge: u64,
    clock: Clock,
    inner: Mutex<Inner>,
}

impl ClientManager {
    pub fn new(total_recharge: u64, clock: Clock) -> Self {
        ClientManager {
            total_recharge,
            clock,
            inner: Mutex::new(Inner { clients: HashMap::new(), stopped: false }),
        }
    }

    /// Register a connected client. Its buffer starts full.
    pub fn register(&self, id: NodeId, params: ServerParams) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return;
        }
        let now = self.clock.now();
        self.recharge_all(&mut inner, now);
        inner.clients.insert(
            id,
            ClientState { params, buf_value: params.buf_limit, last_update: now },
        );
        trace!(client = %id, limit = params.buf_limit, "flow control client registered");
    }

    pub fn unregister(&self, id: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        self.recharge_all(&mut inner, now);
        inner.clients.remove(id);
    }

    /// Reserve `max_cost` from the client's buffer, or say when to retry.
    pub fn accept(&self, id: &NodeId, max_cost: u64) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return Admission::Rejected;
        }
        let now = self.clock.now();
        self.recharge_all(&mut inner, now);

        let rate = self.recharge_rate(&inner, id);
        let Some(client) = inner.clients.get_mut(id) else {
            return Admission::Rejected;
        };
        if max_cost > client.params.buf_limit {
            debug!(client = %id, max_cost, limit = client.params.buf_limit, "request can never fit buffer");
            return Admission::Rejected;
        }
        if client.buf_value >= max_cost {
            client.buf_value -= max_cost;
            return Admission::Accepted { buf_value: client.buf_value };
        }

        let deficit = max_cost - client.buf_value;
        let retry_ns =
            (deficit as u128 * FC_TIME_CONST.as_nanos()).div_ceil(rate.max(1) as u128);
        Admission::Deferred { retry_in: Duration::from_nanos(retry_ns as u64) }
    }

    /// Reserve `max_cost`, waiting through deferrals. Returns the remaining
    /// buffer value, or `None` once the manager rejects (stopped or
    /// impossible cost). Waits are capped so a long deferral still notices
    /// `stop()` promptly.
    pub async fn accept_recharged(&self, id: &NodeId, max_cost: u64) -> Option<u64> {
        const DEFER_POLL_MAX: Duration = Duration::from_millis(100);
        loop {
            match self.accept(id, max_cost) {
                Admission::Accepted { buf_value } => return Some(buf_value),
                Admission::Deferred { retry_in } => {
                    tokio::time::sleep(retry_in.min(DEFER_POLL_MAX)).await
                }
                Admission::Rejected => return None,
            }
        }
    }

    /// Settle a served request: refund the difference between the reserved
    /// worst case and the real cost. Returns the client's buffer value for
    /// echoing back to it.
    pub fn processed(&self, id: &NodeId, max_cost: u64, real_cost: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return 0;
        }
        let now = self.clock.now();
        self.recharge_all(&mut inner, now);
        let Some(client) = inner.clients.get_mut(id) else {
            return 0;
        };
        let refund = max_cost.saturating_sub(real_cost);
        client.buf_value = (client.buf_value + refund).min(client.params.buf_limit);
        client.buf_value
    }

    /// Current credit of a client, after recharge.
    pub fn buffer(&self, id: &NodeId) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return 0;
        }
        let now = self.clock.now();
        self.recharge_all(&mut inner, now);
        inner.clients.get(id).map_or(0, |c| c.buf_value)
    }

    /// Cease recharging and reject all further accounting calls.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        inner.clients.clear();
        debug!("flow control manager stopped");
    }

    /// Recharge rate of one client, in cost units per millisecond: the
    /// guaranteed minimum plus an equal share of the aggregate capacity not
    /// claimed by other recharging clients.
    fn recharge_rate(&self, inner: &Inner, id: &NodeId) -> u64 {
        let recharging: Vec<&ClientState> = inner
            .clients
            .values()
            .filter(|c| c.buf_value < c.params.buf_limit)
            .collect();
        let Some(client) = inner.clients.get(id) else {
            return 0;
        };
        if client.buf_value >= client.params.buf_limit {
            return client.params.min_recharge;
        }
        let sum_min: u64 = recharging.iter().map(|c| c.params.min_recharge).sum();
        let unused = self.total_recharge.saturating_sub(sum_min);
        client.params.min_recharge + unused / recharging.len() as u64
    }

    /// Apply recharge to every client for the time elapsed since its last
    /// update. The fair share is computed against the set of clients that
    /// were recharging at the start of the interval.
    fn recharge_all(&self, inner: &mut Inner, now: AbsTime) {
        let recharging: Vec<NodeId> = inner
            .clients
            .iter()
            .filter(|(_, c)| c.buf_value < c.params.buf_limit)
            .map(|(id, _)| *id)
            .collect();
        if recharging.is_empty() {
            for client in inner.clients.values_mut() {
                client.last_update = now;
            }
            return;
        }
        let sum_min: u64 = recharging
            .iter()
            .map(|id| inner.clients[id].params.min_recharge)
            .sum();
        let share = self.total_recharge.saturating_sub(sum_min) / recharging.len() as u64;

        for (id, client) in inner.clients.iter_mut() {
            let dt = now.saturating_since(client.last_update);
            client.last_update = now;
            if dt == 0 || client.buf_value >= client.params.buf_limit {
                continue;
            }
            let rate = client.params.min_recharge + if recharging.contains(id) { share } else { 0 };
            let gained = (rate as u128 * dt as u128 / FC_TIME_CONST.as_nanos()) as u64;
            client.buf_value = client.buf_value.saturating_add(gained).min(client.params.buf_limit);
        }
    }
}
