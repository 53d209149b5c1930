//! # Request Cost Statistics
//!
//! The light server learns the real cost of serving each request type
//! online: every served request feeds `(request count, measured cost)` into
//! a per-message-code linear regression, and the advertised cost table is
//! read back off the fitted line with a 2x safety margin. Clients use the
//! table to predict how much buffer a request will drain before sending it.
//!
//! The regression window is bounded: once a code has accumulated
//! [`LIN_REG_MAX_CNT`] samples, all sums decay proportionally before each
//! new one, approximating exponential forgetting.
//!
//! State persists across restarts in the node database under
//! `"_requestCostStats"`, as an RLP list of `[msg_code, 40-byte sums]`
//! pairs. A fresh (or undecodable) state starts from a pessimistic prior of
//! 100 zero samples, damping the first real measurements.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::db::NodeDb;
use crate::rlp;

/// Sample-count cap of one regression accumulator.
pub const LIN_REG_MAX_CNT: u64 = 100_000;

/// Virtual sample count of the initial prior.
const PRIOR_CNT: u64 = 100;

/// Below this determinant the fit degenerates to the sample mean.
const DEGENERATE_EPS: f64 = 0.001;

/// Online simple linear regression accumulator.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct LinReg {
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
    cnt: u64,
}

impl LinReg {
    fn with_prior(cnt: u64) -> Self {
        LinReg { cnt, ..Default::default() }
    }

    fn add(&mut self, x: f64, y: f64) {
        if self.cnt >= LIN_REG_MAX_CNT {
            // Proportional decay keeps the window bounded while preserving
            // the fitted line.
            let sub = (self.cnt + 1 - LIN_REG_MAX_CNT) as f64 / LIN_REG_MAX_CNT as f64;
            self.sum_x -= self.sum_x * sub;
            self.sum_y -= self.sum_y * sub;
            self.sum_xx -= self.sum_xx * sub;
            self.sum_xy -= self.sum_xy * sub;
            self.cnt = LIN_REG_MAX_CNT - 1;
        }
        self.cnt += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;
    }

    /// Ordinary least squares: `(intercept, slope)`. Degenerates to the
    /// mean with zero slope when the x-variance vanishes.
    fn calc(&self) -> (f64, f64) {
        if self.cnt == 0 {
            return (0.0, 0.0);
        }
        let cnt = self.cnt as f64;
        let d = cnt * self.sum_xx - self.sum_x * self.sum_x;
        if d < DEGENERATE_EPS {
            return (self.sum_y / cnt, 0.0);
        }
        let m = (cnt * self.sum_xy - self.sum_x * self.sum_y) / d;
        let b = self.sum_y / cnt - m * self.sum_x / cnt;
        (b, m)
    }

    /// Fixed 40-byte layout: the four sums as IEEE-754 bit patterns, then
    /// the count, all big-endian.
    fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[0..8].copy_from_slice(&self.sum_x.to_bits().to_be_bytes());
        out[8..16].copy_from_slice(&self.sum_y.to_bits().to_be_bytes());
        out[16..24].copy_from_slice(&self.sum_xx.to_bits().to_be_bytes());
        out[24..32].copy_from_slice(&self.sum_xy.to_bits().to_be_bytes());
        out[32..40].copy_from_slice(&self.cnt.to_be_bytes());
        out
    }

    fn from_bytes(data: &[u8]) -> Option<LinReg> {
        if data.len() != 40 {
            return None;
        }
        let word = |i: usize| u64::from_be_bytes(data[i * 8..(i + 1) * 8].try_into().unwrap());
        Some(LinReg {
            sum_x: f64::from_bits(word(0)),
            sum_y: f64::from_bits(word(1)),
            sum_xx: f64::from_bits(word(2)),
            sum_xy: f64::from_bits(word(3)),
            cnt: word(4),
        })
    }
}

/// One row of the cost table a server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCostEntry {
    pub msg_code: u64,
    pub base_cost: u64,
    pub req_cost: u64,
}

pub type RequestCostList = Vec<RequestCostEntry>;

/// Per-code costs in table form, as used on the serving path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCosts {
    pub base_cost: u64,
    pub req_cost: u64,
}

/// Convert the advertised list form into a lookup table.
pub fn cost_table(list: &RequestCostList) -> HashMap<u64, RequestCosts> {
    list.iter()
        .map(|e| (e.msg_code, RequestCosts { base_cost: e.base_cost, req_cost: e.req_cost }))
        .collect()
}

/// Convert a cost table back into the wire list form, ordered by code.
pub fn cost_list(table: &HashMap<u64, RequestCosts>) -> RequestCostList {
    let mut list: RequestCostList = table
        .iter()
        .map(|(&msg_code, c)| RequestCostEntry {
            msg_code,
            base_cost: c.base_cost,
            req_cost: c.req_cost,
        })
        .collect();
    list.sort_by_key(|e| e.msg_code);
    list
}

/// Learned request cost statistics for a fixed set of message codes.
///
/// Shared between per-peer serving tasks; an interior lock serializes
/// updates.
pub struct RequestCostStats {
    db: NodeDb,
    /// Served message codes in wire order; fixes the persisted layout.
    codes: Vec<u64>,
    stats: Mutex<HashMap<u64, LinReg>>,
}

impl RequestCostStats {
    /// Load persisted statistics, falling back to the prior for missing or
    /// undecodable entries.
    pub fn new(db: NodeDb, codes: &[u64]) -> Self {
        let mut stats: HashMap<u64, LinReg> =
            codes.iter().map(|&c| (c, LinReg::with_prior(PRIOR_CNT))).collect();

        if let Some(blob) = db.load_cost_stats() {
            match decode_stats(&blob) {
                Ok(loaded) => {
                    for (code, reg) in loaded {
                        if let Some(slot) = stats.get_mut(&code) {
                            *slot = reg;
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "persisted cost stats undecodable, using prior");
                }
            }
        }

        RequestCostStats { db, codes: codes.to_vec(), stats: Mutex::new(stats) }
    }

    /// Record one served request batch: `req_cnt` items of `msg_code`
    /// served at `cost`. Unknown codes and empty batches are ignored.
    pub fn update(&self, msg_code: u64, req_cnt: u64, cost: u64) {
        if req_cnt == 0 {
            return;
        }
        let mut stats = self.stats.lock().unwrap();
        if let Some(reg) = stats.get_mut(&msg_code) {
            reg.add(req_cnt as f64, cost as f64);
        }
    }

    /// The cost table to advertise: fitted line per code, negatives
    /// clipped, everything doubled as safety margin.
    pub fn current_list(&self) -> RequestCostList {
        let stats = self.stats.lock().unwrap();
        self.codes
            .iter()
            .map(|&code| {
                let (mut b, mut m) = stats[&code].calc();
                if m < 0.0 {
                    b += m;
                    m = 0.0;
                }
                if b < 0.0 {
                    b = 0.0;
                }
                RequestCostEntry {
                    msg_code: code,
                    base_cost: (b * 2.0) as u64,
                    req_cost: (m * 2.0) as u64,
                }
            })
            .collect()
    }

    /// Persist the current state. Called on shutdown.
    pub fn store(&self) {
        let stats = self.stats.lock().unwrap();
        let items: Vec<Vec<u8>> = self
            .codes
            .iter()
            .map(|&code| {
                rlp::encode_list(&[
                    rlp::encode_u64(code),
                    rlp::encode_bytes(&stats[&code].to_bytes()),
                ])
            })
            .collect();
        self.db.store_cost_stats(&rlp::encode_list(&items));
        debug!(codes = self.codes.len(), "cost stats persisted");
    }
}

fn decode_stats(blob: &[u8]) -> anyhow::Result<Vec<(u64, LinReg)>> {
    let item = rlp::decode(blob)?;
    let mut out = Vec::new();
    for pair in item.as_list()? {
        let pair = pair.as_list()?;
        if pair.len() != 2 {
            anyhow::bail!("cost stats entry has {} fields, want 2", pair.len());
        }
        let code = pair[0].as_u64()?;
        if let Some(reg) = LinReg::from_bytes(pair[1].as_bytes()?) {
            out.push((code, reg));
        }
    }
    Ok(out)
}
