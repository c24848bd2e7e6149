//! Frame Bridge (FB) — spec §4.6.
//!
//! Coalesces an arbitrarily fast producer stream into at most one
//! store update per display frame and maintains latency/FPS/dropped-
//! frame accounting. Always compiled: it has no network dependency of
//! its own, only a [`Clock`] (real or fake) and a inbound slice.

use crate::model::{Metrics, OrderbookSlice};
use crate::store::Store;

/// Target frame period (spec GLOSSARY: "target cadence ≈ 60 Hz").
pub const FRAME_MS: f64 = 1000.0 / 60.0;
/// How often accumulated metrics are published (spec §4.6 step 5).
pub const METRICS_INTERVAL_MS: u64 = 1_000;

/// A monotonic millisecond clock, abstracted so the bridge's frame/
/// latency arithmetic is testable without real sleeps. The `live`
/// production path uses [`MonotonicClock`]; tests supply a
/// hand-advanced fake.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Wall-clock-derived monotonic millisecond clock for production use.
pub struct MonotonicClock {
    start: std::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

struct LatencyAccumulator {
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    count: u64,
    last_ms: f64,
}

impl LatencyAccumulator {
    fn new() -> Self {
        Self {
            min_ms: f64::MAX,
            max_ms: 0.0,
            sum_ms: 0.0,
            count: 0,
            last_ms: 0.0,
        }
    }

    fn record(&mut self, latency_ms: f64) {
        self.min_ms = self.min_ms.min(latency_ms);
        self.max_ms = self.max_ms.max(latency_ms);
        self.sum_ms += latency_ms;
        self.count += 1;
        self.last_ms = latency_ms;
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }

    /// p95 via max as the O(1) estimator (spec §9: "degrades p95 to max
    /// when only O(1) counters are kept — this is acceptable and MUST
    /// be disclosed"). This implementation keeps only running min/max/
    /// sum/count, not a rolling sample window, so p95 reported here is
    /// always `max_ms`.
    fn p95_ms(&self) -> f64 {
        self.max_ms
    }
}

/// The Frame Bridge (spec §4.6). Drives a [`Store`] from an inbound
/// slice stream at the display cadence.
pub struct FrameBridge<C: Clock> {
    clock: C,
    last_frame_ms: Option<u64>,
    latest_slice: Option<OrderbookSlice>,
    latest_receive_ms: Option<u64>,
    dirty: bool,
    dropped_frames: u64,
    frame_count: u64,
    message_count: u64,
    last_metrics_publish_ms: u64,
    latency: LatencyAccumulator,
    hidden: bool,
    /// Set for the shared-memory fabric only (spec §4.6 "Freeze
    /// coupling"): when the store reports frozen, the bridge still
    /// advances its notion of "seen" but skips decoding into pooled
    /// objects the frozen snapshot still references. The shared-memory
    /// reader itself owns the decode step; this flag is exposed so a
    /// caller wiring that reader in can skip the call.
    freeze_coupled: bool,
}

impl<C: Clock> FrameBridge<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last_frame_ms: None,
            latest_slice: None,
            latest_receive_ms: None,
            dirty: false,
            dropped_frames: 0,
            frame_count: 0,
            message_count: 0,
            last_metrics_publish_ms: 0,
            latency: LatencyAccumulator::new(),
            hidden: false,
            freeze_coupled: false,
        }
    }

    pub fn set_freeze_coupled(&mut self, freeze_coupled: bool) {
        self.freeze_coupled = freeze_coupled;
    }

    /// Should be called whether or not decoding happens, to track
    /// "skip decode while frozen" behavior for the shared-memory
    /// fabric (spec §4.6 "Freeze coupling").
    pub fn is_freeze_coupled(&self) -> bool {
        self.freeze_coupled
    }

    /// Records an inbound slice (spec §4.6 "Receive"): stamps the
    /// receive time, replaces the latest-slice reference, marks dirty.
    pub fn on_slice(&mut self, slice: OrderbookSlice) {
        self.latest_receive_ms = Some(self.clock.now_ms());
        self.latest_slice = Some(slice);
        self.dirty = true;
        self.message_count += 1;
    }

    /// Resets rolling counters and timestamps so that a platform
    /// "hidden" transition (backgrounding) doesn't register a huge
    /// frame delta or pseudo-latency on resume (spec §4.6 "Background
    /// handling"). Also drops any slice that was received and marked
    /// dirty just before hiding: otherwise the first post-resume tick
    /// would compute `latency = now(resumed) - receive_time(pre-hide)`,
    /// feeding a huge bogus sample into min/avg/max/p95.
    pub fn set_hidden(&mut self, hidden: bool) {
        if hidden && !self.hidden {
            self.last_frame_ms = None;
            self.last_metrics_publish_ms = self.clock.now_ms();
            self.latest_receive_ms = None;
            self.dirty = false;
        }
        self.hidden = hidden;
    }

    /// One frame tick (spec §4.6 "Loop"). Drives `store` and returns
    /// `Some(metrics)` when the ≥1000ms metrics-publish boundary is
    /// crossed.
    pub fn tick(&mut self, store: &Store) -> Option<Metrics> {
        let now = self.clock.now_ms();

        if let Some(last_frame) = self.last_frame_ms {
            let frame_delta = now.saturating_sub(last_frame) as f64;
            if !self.hidden {
                let missed = ((frame_delta / FRAME_MS).floor() - 1.0).max(0.0) as u64;
                self.dropped_frames += missed;
            }
        }
        self.last_frame_ms = Some(now);
        self.frame_count += 1;

        if self.dirty {
            if let (Some(slice), Some(receive_ms)) = (self.latest_slice.clone(), self.latest_receive_ms)
            {
                let latency_ms = now.saturating_sub(receive_ms) as f64;
                self.latency.record(latency_ms);
                store.update_live(slice);
            }
            self.dirty = false;
        }

        let elapsed_since_publish = now.saturating_sub(self.last_metrics_publish_ms);
        if elapsed_since_publish >= METRICS_INTERVAL_MS {
            let elapsed_s = (elapsed_since_publish.max(1)) as f64 / 1000.0;
            let fps = (self.frame_count as f64 / elapsed_s).round();
            let messages_per_second = self.message_count as f64 / elapsed_s;

            let metrics = Metrics {
                messages_per_second,
                latency_cur_ms: self.latency.last_ms,
                latency_min_ms: if self.latency.count == 0 {
                    0.0
                } else {
                    self.latency.min_ms
                },
                latency_avg_ms: self.latency.avg_ms(),
                latency_max_ms: self.latency.max_ms,
                latency_p95_ms: self.latency.p95_ms(),
                fps,
                dropped_frames: self.dropped_frames,
                heap_used_mb: 0.0,
                heap_growth_mb: 0.0,
                reconnect_count: 0,
                sequence_gaps: 0,
                tab_count: 0,
            };

            self.frame_count = 0;
            self.message_count = 0;
            self.latency.reset();
            self.last_metrics_publish_ms = now;

            store.update_metrics(metrics.clone());
            return Some(metrics);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionStatus;
    use std::cell::Cell;

    struct FakeClock {
        now: Cell<u64>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self { now: Cell::new(0) }
        }
        fn advance(&self, ms: u64) {
            self.now.set(self.now.get() + ms);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }
    }

    fn sample_slice() -> OrderbookSlice {
        OrderbookSlice {
            bids: vec![],
            asks: vec![],
            spread: 0.0,
            spread_percent: 0.0,
            midpoint: 0.0,
            timestamp_ms: 0,
            last_update_id: 1,
        }
    }

    #[test]
    fn latency_is_never_negative() {
        let clock = FakeClock::new();
        let bridge_clock = FakeClock::new();
        let mut bridge = FrameBridge::new(bridge_clock);
        let store = Store::new();

        bridge.on_slice(sample_slice());
        clock.advance(5);
        bridge.tick(&store);

        assert_eq!(store.live_slice().unwrap().last_update_id, 1);
    }

    #[test]
    fn dirty_slice_updates_store_and_clears_dirty() {
        let clock = FakeClock::new();
        let mut bridge = FrameBridge::new(clock);
        let store = Store::new();

        bridge.on_slice(sample_slice());
        bridge.tick(&store);
        assert!(store.live_slice().is_some());
    }

    #[test]
    fn dropped_frames_counted_from_large_gaps() {
        struct SharedFakeClock {
            now: std::rc::Rc<Cell<u64>>,
        }
        impl Clock for SharedFakeClock {
            fn now_ms(&self) -> u64 {
                self.now.get()
            }
        }

        let now = std::rc::Rc::new(Cell::new(0));
        let mut bridge = FrameBridge::new(SharedFakeClock { now: now.clone() });
        let store = Store::new();
        store.set_status(ConnectionStatus::Connected);

        bridge.tick(&store);
        // A gap of ~150ms at 60Hz (16.67ms/frame) should register
        // roughly 8 missed frames (150/16.67 - 1).
        now.set(150);
        bridge.tick(&store);
        let metrics = bridge.tick(&store).unwrap_or_else(|| {
            now.set(1_100);
            bridge.tick(&store).expect("metrics should publish by now")
        });
        assert!(metrics.dropped_frames >= 7);
    }

    #[test]
    fn hidden_reset_prevents_dropped_frame_spike_on_resume() {
        struct SharedFakeClock {
            now: std::rc::Rc<Cell<u64>>,
        }
        impl Clock for SharedFakeClock {
            fn now_ms(&self) -> u64 {
                self.now.get()
            }
        }

        let now = std::rc::Rc::new(Cell::new(0));
        let mut bridge = FrameBridge::new(SharedFakeClock { now: now.clone() });
        let store = Store::new();

        bridge.tick(&store);
        bridge.set_hidden(true);
        now.set(5_000);
        bridge.set_hidden(false);
        let metrics = bridge.tick(&store);
        // last_frame_ms was cleared on hide, so this tick establishes a
        // fresh baseline instead of counting the 5s gap as dropped frames.
        if let Some(metrics) = metrics {
            assert_eq!(metrics.dropped_frames, 0);
        }
    }

    #[test]
    fn hiding_drops_a_pending_dirty_slice_so_resume_has_no_bogus_latency() {
        struct SharedFakeClock {
            now: std::rc::Rc<Cell<u64>>,
        }
        impl Clock for SharedFakeClock {
            fn now_ms(&self) -> u64 {
                self.now.get()
            }
        }

        let now = std::rc::Rc::new(Cell::new(0));
        let mut bridge = FrameBridge::new(SharedFakeClock { now: now.clone() });
        let store = Store::new();

        // A slice arrives and is marked dirty just before hiding.
        bridge.on_slice(sample_slice());
        bridge.set_hidden(true);

        // A long background period passes, then the tab resumes.
        now.set(10_000);
        bridge.set_hidden(false);
        bridge.tick(&store);
        now.set(11_100);
        let metrics = bridge.tick(&store).expect("metrics should publish by now");

        // Without the fix, latency would be computed as ~10_000ms (now at
        // resume minus the receive time recorded before hiding).
        assert_eq!(metrics.latency_max_ms, 0.0);
        assert_eq!(metrics.latency_cur_ms, 0.0);
    }

    #[test]
    fn metrics_publish_after_interval_resets_counters() {
        struct SharedFakeClock {
            now: std::rc::Rc<Cell<u64>>,
        }
        impl Clock for SharedFakeClock {
            fn now_ms(&self) -> u64 {
                self.now.get()
            }
        }

        let now = std::rc::Rc::new(Cell::new(0));
        let mut bridge = FrameBridge::new(SharedFakeClock { now: now.clone() });
        let store = Store::new();

        bridge.on_slice(sample_slice());
        now.set(1_100);
        let metrics = bridge.tick(&store).expect("metrics should publish");
        assert_eq!(metrics.fps, 1.0);
    }
}
