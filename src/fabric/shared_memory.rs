//! Shared-Memory fabric — spec §4.5.3/§6.3.
//!
//! A single writer serializes a slice into a fixed 2048-byte region and
//! signals readiness with one atomic version counter (release on
//! write, acquire on read); readers poll the counter on their own
//! cadence and decode only on change.
//!
//! This crate has no real cross-process shared-memory transport
//! dependency available in the pack (an external crate for that would
//! be a fabricated dependency), so [`SharedRegion`] emulates the same
//! byte-for-byte layout and ordering contract in-process behind an
//! `Arc`. An embedding application that needs the region to cross a
//! process boundary maps this same byte layout onto real shared
//! memory; the protocol in this module is unchanged either way.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::model::{OrderbookSlice, PriceLevel};

pub const REGION_BYTES: usize = 2048;
pub const MAX_LEVELS: usize = 15;
const LEVEL_BYTES: usize = 32;
const BIDS_OFFSET: usize = 56;
const ASKS_OFFSET: usize = BIDS_OFFSET + MAX_LEVELS * LEVEL_BYTES;

fn write_f64(buf: &mut [u8], offset: usize, value: f64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_f64(buf: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

fn write_levels(buf: &mut [u8], offset: usize, levels: &[PriceLevel]) {
    for (i, level) in levels.iter().take(MAX_LEVELS).enumerate() {
        let base = offset + i * LEVEL_BYTES;
        write_f64(buf, base, level.price);
        write_f64(buf, base + 8, level.size);
        write_f64(buf, base + 16, level.cumulative);
        write_f64(buf, base + 24, level.depth_percent);
    }
}

fn read_levels(buf: &[u8], offset: usize, count: usize, out: &mut Vec<PriceLevel>) {
    out.clear();
    for i in 0..count.min(MAX_LEVELS) {
        let base = offset + i * LEVEL_BYTES;
        out.push(PriceLevel {
            price: read_f64(buf, base),
            size: read_f64(buf, base + 8),
            cumulative: read_f64(buf, base + 16),
            depth_percent: read_f64(buf, base + 24),
        });
    }
}

/// Encodes `slice` into `buf` per the §6.3 layout, skipping the version
/// field at offset 0 (owned by [`SharedRegion::write`]'s caller).
fn encode_into(buf: &mut [u8; REGION_BYTES], slice: &OrderbookSlice) {
    write_i32(buf, 4, slice.bids.len().min(MAX_LEVELS) as i32);
    write_i32(buf, 8, slice.asks.len().min(MAX_LEVELS) as i32);
    write_f64(buf, 16, slice.spread);
    write_f64(buf, 24, slice.spread_percent);
    write_f64(buf, 32, slice.midpoint);
    write_f64(buf, 40, slice.timestamp_ms as f64);
    write_f64(buf, 48, slice.last_update_id as f64);
    write_levels(buf, BIDS_OFFSET, &slice.bids);
    write_levels(buf, ASKS_OFFSET, &slice.asks);
}

/// The fixed-layout region (spec §6.3). Single writer, multiple
/// readers; `version` is the sole atomic.
pub struct SharedRegion {
    version: AtomicI32,
    buf: UnsafeCell<[u8; REGION_BYTES]>,
}

// SAFETY: `buf` is written only by the single writer half of this
// fabric and read only after observing the writer's release store on
// `version`, per the protocol in spec §4.5.3. There is exactly one
// writer by construction (callers hold the only `Writer`).
unsafe impl Sync for SharedRegion {}
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            version: AtomicI32::new(0),
            buf: UnsafeCell::new([0u8; REGION_BYTES]),
        })
    }
}

/// The single producer side of a [`SharedRegion`].
pub struct Writer {
    region: Arc<SharedRegion>,
}

impl Writer {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    /// Writes `slice` into the region, then atomically increments the
    /// version with release semantics so all prior writes become
    /// visible before the counter change is observable (spec §4.5.3
    /// "Write protocol").
    pub fn write(&self, slice: &OrderbookSlice) {
        // SAFETY: this is the sole writer (single `Writer` per region
        // by construction); no reader observes these stores until the
        // release store on `version` below publishes them.
        let buf = unsafe { &mut *self.region.buf.get() };
        encode_into(buf, slice);
        self.region.version.fetch_add(1, Ordering::Release);
    }

    pub fn region(&self) -> Arc<SharedRegion> {
        self.region.clone()
    }
}

/// Pre-allocated decode target reused across reads to avoid per-frame
/// allocation (spec §4.5.3 "Pooled decode").
pub struct Reader {
    region: Arc<SharedRegion>,
    last_version: i32,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    spread: f64,
    spread_percent: f64,
    midpoint: f64,
    timestamp_ms: f64,
    last_update_id: f64,
}

impl Reader {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            last_version: 0,
            bids: Vec::with_capacity(MAX_LEVELS),
            asks: Vec::with_capacity(MAX_LEVELS),
            spread: 0.0,
            spread_percent: 0.0,
            midpoint: 0.0,
            timestamp_ms: 0.0,
            last_update_id: 0.0,
        }
    }

    /// Atomically loads the version (acquire). If unchanged since the
    /// last poll, does nothing and returns `false`; otherwise decodes
    /// the region into the pooled buffers and returns `true` (spec
    /// §4.5.3 "Read protocol").
    pub fn poll(&mut self) -> bool {
        let version = self.region.version.load(Ordering::Acquire);
        if version == self.last_version {
            return false;
        }

        // SAFETY: the acquire load above establishes a happens-before
        // relationship with the writer's release store, so these reads
        // observe a complete write (protocol assumption in spec
        // §4.5.3: writer cadence stays well below reader cadence).
        let buf = unsafe { &*self.region.buf.get() };
        let bid_count = read_i32(buf, 4).clamp(0, MAX_LEVELS as i32) as usize;
        let ask_count = read_i32(buf, 8).clamp(0, MAX_LEVELS as i32) as usize;
        self.spread = read_f64(buf, 16);
        self.spread_percent = read_f64(buf, 24);
        self.midpoint = read_f64(buf, 32);
        self.timestamp_ms = read_f64(buf, 40);
        self.last_update_id = read_f64(buf, 48);
        read_levels(buf, BIDS_OFFSET, bid_count, &mut self.bids);
        read_levels(buf, ASKS_OFFSET, ask_count, &mut self.asks);

        self.last_version = version;
        true
    }

    pub fn version(&self) -> i32 {
        self.last_version
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    /// Reassembles the pooled fields into an owned slice. Allocates
    /// only the wrapper and two shallow copies of the pooled vectors,
    /// per spec §4.5.3.
    pub fn to_slice(&self) -> OrderbookSlice {
        OrderbookSlice {
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            spread: self.spread,
            spread_percent: self.spread_percent,
            midpoint: self.midpoint,
            timestamp_ms: self.timestamp_ms as u64,
            last_update_id: self.last_update_id as u64,
        }
    }
}
