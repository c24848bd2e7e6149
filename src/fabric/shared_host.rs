//! Shared-Host fabric — spec §4.5.1.
//!
//! A single Producer Host lives in an out-of-process host reachable by
//! every attached consumer. Ports are represented here as channels; an
//! embedding application wires the channel's other end to whatever
//! transport actually crosses the process boundary (spec §1 boundary).

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::model::{ConnectionStatus, OrderbookSlice};

/// Visible-port TTL: dropped if not seen in >= 6s (spec §4.5.1).
pub const VISIBLE_TTL_MS: u64 = 6_000;
/// Hidden-port TTL: dropped if not seen in >= 60s.
pub const HIDDEN_TTL_MS: u64 = 60_000;
/// Pruner scan interval (spec §5 "Timeouts").
pub const PRUNE_INTERVAL_MS: u64 = 3_000;

/// A frame sent down one port.
#[derive(Debug, Clone)]
pub enum Frame {
    OrderbookUpdate {
        data: OrderbookSlice,
        producer_timestamp_ms: u64,
    },
    StatusChange {
        status: ConnectionStatus,
        error: Option<String>,
    },
    Metrics {
        tab_count: usize,
    },
}

struct Port {
    tx: mpsc::UnboundedSender<Frame>,
    last_seen_ms: u64,
    hidden: bool,
}

/// Indexes attached ports and fans out published slices, matching the
/// out-of-process host described in spec §4.5.1.
#[derive(Default)]
pub struct SharedHost {
    ports: HashMap<u64, Port>,
    next_id: u64,
    last_status: Option<ConnectionStatus>,
    last_slice: Option<OrderbookSlice>,
}

impl SharedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Attaches a new consumer port. Performs the late-joiner handshake
    /// (spec §4.5.1): if the host already has a known status, the
    /// joiner immediately receives it, plus a fresh slice if
    /// synchronized.
    pub fn attach(&mut self, now_ms: u64) -> (u64, mpsc::UnboundedReceiver<Frame>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(status) = &self.last_status {
            let _ = tx.send(Frame::StatusChange {
                status: status.clone(),
                error: None,
            });
            if status.is_connected() {
                if let Some(slice) = &self.last_slice {
                    let _ = tx.send(Frame::OrderbookUpdate {
                        data: slice.clone(),
                        producer_timestamp_ms: now_ms,
                    });
                }
            }
        }

        self.ports.insert(
            id,
            Port {
                tx,
                last_seen_ms: now_ms,
                hidden: false,
            },
        );
        self.emit_tab_count();
        (id, rx)
    }

    /// Drops a port explicitly (consumer disconnect), independent of
    /// the pruner.
    pub fn detach(&mut self, id: u64) {
        if self.ports.remove(&id).is_some() {
            self.emit_tab_count();
        }
    }

    /// Refreshes a port's liveness timestamp (spec §4.5.1, "every
    /// consumer message refreshes its port's last_seen_ms").
    pub fn mark_seen(&mut self, id: u64, now_ms: u64) {
        if let Some(port) = self.ports.get_mut(&id) {
            port.last_seen_ms = now_ms;
        }
    }

    /// Updates a port's visibility and, on resume (hidden -> visible),
    /// immediately sends it a fresh slice (spec §4.5.1 "Visibility").
    pub fn set_visibility(&mut self, id: u64, hidden: bool, now_ms: u64) {
        let Some(port) = self.ports.get_mut(&id) else {
            return;
        };
        let was_hidden = port.hidden;
        port.hidden = hidden;
        port.last_seen_ms = now_ms;

        if was_hidden && !hidden {
            if let Some(slice) = self.last_slice.clone() {
                let _ = port.tx.send(Frame::OrderbookUpdate {
                    data: slice,
                    producer_timestamp_ms: now_ms,
                });
            }
        }
    }

    /// Broadcasts a published slice to every non-hidden port (spec
    /// §4.5.1 "Broadcast").
    pub fn broadcast_slice(&mut self, slice: OrderbookSlice, producer_timestamp_ms: u64) {
        self.last_slice = Some(slice.clone());
        for port in self.ports.values() {
            if port.hidden {
                continue;
            }
            let _ = port.tx.send(Frame::OrderbookUpdate {
                data: slice.clone(),
                producer_timestamp_ms,
            });
        }
    }

    /// Broadcasts a status change to every port, hidden or not (spec
    /// §4.5.1: only slice backpressure is hidden-filtered).
    pub fn broadcast_status(&mut self, status: ConnectionStatus, error: Option<String>) {
        self.last_status = Some(status.clone());
        for port in self.ports.values() {
            let _ = port.tx.send(Frame::StatusChange {
                status: status.clone(),
                error: error.clone(),
            });
        }
    }

    fn emit_tab_count(&mut self) {
        let count = self.ports.len();
        for port in self.ports.values() {
            let _ = port.tx.send(Frame::Metrics { tab_count: count });
        }
    }

    /// Drops ports not seen within their TTL (visible: 6s, hidden:
    /// 60s). Returns `true` if the port set became empty, signalling
    /// the caller to tear down TC/SM/BE (spec §4.5.1 "Liveness").
    pub fn prune(&mut self, now_ms: u64) -> bool {
        let before = self.ports.len();
        self.ports.retain(|_, port| {
            let ttl = if port.hidden {
                HIDDEN_TTL_MS
            } else {
                VISIBLE_TTL_MS
            };
            now_ms.saturating_sub(port.last_seen_ms) < ttl
        });
        if self.ports.len() != before {
            self.emit_tab_count();
        }
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriceLevel;

    fn sample_slice() -> OrderbookSlice {
        OrderbookSlice {
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
        }
    }

    #[test]
    fn late_joiner_gets_status_and_slice() {
        let mut host = SharedHost::new();
        host.broadcast_status(ConnectionStatus::Connected, None);
        host.broadcast_slice(sample_slice(), 1000);

        let (_id, mut rx) = host.attach(2000);
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Frame::StatusChange { status: ConnectionStatus::Connected, .. }));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, Frame::OrderbookUpdate { .. }));
    }

    #[test]
    fn hidden_ports_are_skipped_on_broadcast() {
        let mut host = SharedHost::new();
        let (id, mut rx) = host.attach(0);
        // Drain the tab-count frame from attach.
        let _ = rx.try_recv();

        host.set_visibility(id, true, 0);
        host.broadcast_slice(sample_slice(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resume_from_hidden_sends_fresh_slice() {
        let mut host = SharedHost::new();
        let (id, mut rx) = host.attach(0);
        let _ = rx.try_recv();

        host.broadcast_slice(sample_slice(), 1);
        let _ = rx.try_recv().unwrap();

        host.set_visibility(id, true, 2);
        host.broadcast_slice(sample_slice(), 3);
        assert!(rx.try_recv().is_err());

        host.set_visibility(id, false, 4);
        let frame = rx.try_recv().unwrap();
        assert!(matches!(frame, Frame::OrderbookUpdate { .. }));
    }

    #[test]
    fn prune_drops_stale_visible_ports_and_reports_empty() {
        let mut host = SharedHost::new();
        let (_id, _rx) = host.attach(0);
        assert!(!host.prune(VISIBLE_TTL_MS - 1));
        assert!(host.prune(VISIBLE_TTL_MS + 1));
        assert!(host.is_empty());
    }

    #[test]
    fn prune_gives_hidden_ports_a_longer_ttl() {
        let mut host = SharedHost::new();
        let (id, _rx) = host.attach(0);
        host.set_visibility(id, true, 0);
        assert!(!host.prune(VISIBLE_TTL_MS + 1));
        assert!(host.prune(HIDDEN_TTL_MS + 1));
    }

    #[test]
    fn tab_count_emitted_on_membership_change() {
        let mut host = SharedHost::new();
        let (_id1, mut rx1) = host.attach(0);
        let _ = rx1.try_recv().unwrap(); // tab_count=1 for port 1

        let (_id2, mut rx2) = host.attach(0);
        // Both ports should see tab_count=2 after the second attach.
        let frame1 = rx1.try_recv().unwrap();
        assert!(matches!(frame1, Frame::Metrics { tab_count: 2 }));
        let frame2 = rx2.try_recv().unwrap();
        assert!(matches!(frame2, Frame::Metrics { tab_count: 2 }));
    }
}
