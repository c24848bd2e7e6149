//! Book Engine (BE) — spec §4.3.
//!
//! Stores one `price -> size` map per side and produces top-N slices on
//! demand. No I/O; deterministic given its inputs, so every behavior
//! here is covered by plain `#[test]`s rather than async tests.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ordered_float::OrderedFloat;

use crate::model::{OrderbookSlice, PriceLevel, RawDelta, Snapshot};

/// All active price levels per side, owned exclusively by the
/// [`BookEngine`] (spec §3, "BookState"). No level with size = 0 is
/// ever retained; no NaN prices or sizes are ever inserted.
#[derive(Debug, Clone, Default)]
pub struct BookState {
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    last_update_id: u64,
}

impl BookState {
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.len()
    }
}

/// Parses a wire (price, qty) string pair into finite f64s. Returns
/// `None` for anything that doesn't parse or produces NaN/infinite —
/// per spec §4.3 the pair is skipped rather than treated as an error.
fn parse_level(price: &str, qty: &str) -> Option<(f64, f64)> {
    let price: f64 = price.parse().ok()?;
    let qty: f64 = qty.parse().ok()?;
    if !price.is_finite() || !qty.is_finite() {
        return None;
    }
    Some((price, qty))
}

fn upsert_or_remove(side: &mut BTreeMap<OrderedFloat<f64>, f64>, price: f64, size: f64) {
    let key = OrderedFloat(price);
    if size == 0.0 {
        side.remove(&key);
    } else if size > 0.0 {
        side.insert(key, size);
    }
    // size < 0.0 cannot happen for a finite, non-negative-by-invariant
    // quantity; if an upstream bug ever sends one, leave the level alone
    // rather than inserting a level that violates size >= 0.
}

/// The Book Engine (spec §4.3): applies snapshots/deltas idempotently
/// and produces [`OrderbookSlice`]s at whatever cadence the caller
/// polls at (typically ~100ms while synchronized, per spec §4.4).
#[derive(Debug, Clone)]
pub struct BookEngine {
    state: BookState,
    depth: u32,
    dirty: bool,
}

impl BookEngine {
    /// Creates an engine with the given default slice depth (spec §6.1,
    /// default 15).
    pub fn new(depth: u32) -> Self {
        Self {
            state: BookState::default(),
            depth,
            dirty: false,
        }
    }

    pub fn state(&self) -> &BookState {
        &self.state
    }

    /// Clears both sides, inserts every (price, size) pair with size > 0
    /// and finite values, and sets `last_update_id` (spec §4.3).
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.state.bids.clear();
        self.state.asks.clear();
        for (price, qty) in &snapshot.bids {
            if let Some((p, s)) = parse_level(price, qty) {
                if s > 0.0 {
                    self.state.bids.insert(OrderedFloat(p), s);
                }
            }
        }
        for (price, qty) in &snapshot.asks {
            if let Some((p, s)) = parse_level(price, qty) {
                if s > 0.0 {
                    self.state.asks.insert(OrderedFloat(p), s);
                }
            }
        }
        self.state.last_update_id = snapshot.last_update_id;
        self.dirty = true;
    }

    /// For each (price, size) on each side: skip if non-finite, remove
    /// if size == 0, else upsert. Sets `last_update_id` and marks dirty
    /// (spec §4.3).
    pub fn apply_delta(&mut self, delta: &RawDelta) {
        for (price, qty) in &delta.bids {
            if let Some((p, s)) = parse_level(price, qty) {
                upsert_or_remove(&mut self.state.bids, p, s);
            }
        }
        for (price, qty) in &delta.asks {
            if let Some((p, s)) = parse_level(price, qty) {
                upsert_or_remove(&mut self.state.asks, p, s);
            }
        }
        self.state.last_update_id = delta.final_update_id;
        self.dirty = true;
    }

    /// Updates the depth used by future slices; does not touch stored
    /// levels (spec §4.3).
    pub fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Returns whether the book has changed since the last `take_dirty`
    /// call, and clears the flag. Polled by the Producer Host's cadence
    /// tick (spec §4.4).
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Produces a top-`depth` slice with cumulative and depth-percent
    /// fields plus spread/midpoint (spec §4.3 "getSlice").
    pub fn get_slice(&self) -> OrderbookSlice {
        let depth = self.depth as usize;

        let mut bids = Vec::with_capacity(depth.min(self.state.bids.len()));
        let mut cum = 0.0;
        for (price, size) in self.state.bids.iter().rev().take(depth) {
            cum += size;
            bids.push(PriceLevel {
                price: price.0,
                size: *size,
                cumulative: cum,
                depth_percent: 0.0,
            });
        }
        let bid_total = cum;

        let mut asks = Vec::with_capacity(depth.min(self.state.asks.len()));
        let mut cum = 0.0;
        for (price, size) in self.state.asks.iter().take(depth) {
            cum += size;
            asks.push(PriceLevel {
                price: price.0,
                size: *size,
                cumulative: cum,
                depth_percent: 0.0,
            });
        }
        let ask_total = cum;

        let max_total = bid_total.max(ask_total);
        if max_total > 0.0 {
            for level in bids.iter_mut().chain(asks.iter_mut()) {
                level.depth_percent = (level.cumulative / max_total * 10_000.0).round() / 100.0;
            }
        }

        let best_bid = bids.first().map(|l| l.price);
        let best_ask = asks.first().map(|l| l.price);

        let (spread, midpoint) = match (best_bid, best_ask) {
            (Some(b), Some(a)) => (a - b, (a + b) / 2.0),
            _ => (0.0, 0.0),
        };
        let spread_percent = if midpoint > 0.0 {
            spread / midpoint
        } else {
            0.0
        };

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        OrderbookSlice {
            bids,
            asks,
            spread,
            spread_percent,
            midpoint,
            timestamp_ms,
            last_update_id: self.state.last_update_id,
        }
    }
}
