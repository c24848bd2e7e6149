//! The data model shared across every component (spec §3).

use serde::{Deserialize, Serialize};

/// Which side of the book a level or delta entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// One price level in a published [`OrderbookSlice`].
///
/// Read-only once produced; `cumulative` is strictly monotonic within a
/// side and `depth_percent` is derived from the deeper side's total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
    pub cumulative: f64,
    pub depth_percent: f64,
}

/// One event carrying a sequence range and upsert/remove operations
/// (spec §3, "RawDelta"). `price`/`qty` are kept as the wire strings
/// Binance sends; [`crate::book::BookEngine::apply_delta`] parses them
/// strictly and skips any pair that doesn't parse to a finite value.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelta {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub symbol: String,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

/// A complete order-book snapshot valid as of `last_update_id` (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub last_update_id: u64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

/// Top-N order-book snapshot derived from `BookState` at a point in time
/// (spec §3, "OrderbookSlice"). Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookSlice {
    /// Best first, descending price.
    pub bids: Vec<PriceLevel>,
    /// Best first, ascending price.
    pub asks: Vec<PriceLevel>,
    pub spread: f64,
    pub spread_percent: f64,
    pub midpoint: f64,
    pub timestamp_ms: u64,
    pub last_update_id: u64,
}

impl OrderbookSlice {
    /// Best bid, if the book has any bids.
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// Best ask, if the book has any asks.
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }
}

/// Connection lifecycle reported to the [`crate::store::Store`] (spec §3/§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Syncing,
    Connected,
    Reconnecting,
    Error { message: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_terminal_error(&self) -> bool {
        matches!(self, ConnectionStatus::Error { .. })
    }
}

/// Rolling metrics published roughly every second by the Frame Bridge
/// (spec §3/§4.6/§9). `latency_p95_ms` here is the O(1)-estimator
/// degradation sanctioned by spec §9 (equal to `latency_max_ms`) rather
/// than a sort+index over a rolling sample window; this is a diagnostic
/// figure, not a correctness contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub messages_per_second: f64,
    pub latency_cur_ms: f64,
    pub latency_min_ms: f64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: f64,
    pub latency_p95_ms: f64,
    pub fps: f64,
    pub dropped_frames: u64,
    pub heap_used_mb: f64,
    pub heap_growth_mb: f64,
    pub reconnect_count: u64,
    pub sequence_gaps: u64,
    pub tab_count: usize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            messages_per_second: 0.0,
            latency_cur_ms: 0.0,
            latency_min_ms: 0.0,
            latency_avg_ms: 0.0,
            latency_max_ms: 0.0,
            latency_p95_ms: 0.0,
            fps: 0.0,
            dropped_frames: 0,
            heap_used_mb: 0.0,
            heap_growth_mb: 0.0,
            reconnect_count: 0,
            sequence_gaps: 0,
            tab_count: 0,
        }
    }
}

/// Tags which [`crate::fabric`] variant a [`Session`] is running under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Shared,
    Leader,
    SharedMemory,
}

/// One consumer context's identity and role (spec §3, "Session").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub tab_id: String,
    pub leader: bool,
    pub sync_mode: SyncMode,
}

impl Session {
    /// Generates a session with a random tab id, the way a new consumer
    /// context mints its identity on startup.
    #[cfg(feature = "live")]
    pub fn new(sync_mode: SyncMode) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let tab_id: String = (0..16)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        Self {
            tab_id,
            leader: false,
            sync_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_predicates() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Syncing.is_connected());
        assert!(ConnectionStatus::Error {
            message: "boom".into()
        }
        .is_terminal_error());
    }

    #[test]
    fn slice_best_levels() {
        let slice = OrderbookSlice {
            bids: vec![PriceLevel {
                price: 100.0,
                size: 1.0,
                cumulative: 1.0,
                depth_percent: 100.0,
            }],
            asks: vec![],
            spread: 0.0,
            spread_percent: 0.0,
            midpoint: 0.0,
            timestamp_ms: 0,
            last_update_id: 1,
        };
        assert_eq!(slice.best_bid().unwrap().price, 100.0);
        assert!(slice.best_ask().is_none());
    }
}
