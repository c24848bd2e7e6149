//! Reactive Store (RS) — spec §4.7.
//!
//! A process-local state container with field-granular change
//! notification. Always compiled; has no I/O of its own and is
//! infallible (spec §7, "Store errors — none").

use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::model::{ConnectionStatus, Metrics, OrderbookSlice, SyncMode};

/// One field's current value plus a watch channel so subscribers can
/// be notified at field granularity (spec §4.7 "selector-based").
/// `watch` only notifies on send, so every setter below is a no-op
/// (no notification) when the new value is identical to the old one —
/// the "stable empty-collection sentinels" requirement of spec §9.
struct Field<T: Clone + PartialEq> {
    value: RwLock<T>,
    tx: watch::Sender<()>,
}

impl<T: Clone + PartialEq> Field<T> {
    fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(());
        Self {
            value: RwLock::new(initial),
            tx,
        }
    }

    fn get(&self) -> T {
        self.value.read().unwrap().clone()
    }

    fn set(&self, new_value: T) {
        let changed = {
            let mut guard = self.value.write().unwrap();
            if *guard == new_value {
                false
            } else {
                *guard = new_value;
                true
            }
        };
        if changed {
            let _ = self.tx.send(());
        }
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.tx.subscribe()
    }
}

/// The Reactive Store (spec §4.7): `{live_slice?, frozen_slice?,
/// frozen, status, error?, metrics, is_leader, sync_mode}`.
pub struct Store {
    live_slice: Field<Option<OrderbookSlice>>,
    frozen_slice: Field<Option<OrderbookSlice>>,
    frozen: Field<bool>,
    status: Field<ConnectionStatus>,
    error: Field<Option<String>>,
    metrics: Field<Metrics>,
    is_leader: Field<bool>,
    sync_mode: Field<Option<SyncMode>>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live_slice: Field::new(None),
            frozen_slice: Field::new(None),
            frozen: Field::new(false),
            status: Field::new(ConnectionStatus::Disconnected),
            error: Field::new(None),
            metrics: Field::new(Metrics::default()),
            is_leader: Field::new(false),
            sync_mode: Field::new(None),
        })
    }

    pub fn live_slice(&self) -> Option<OrderbookSlice> {
        self.live_slice.get()
    }

    pub fn frozen_slice(&self) -> Option<OrderbookSlice> {
        self.frozen_slice.get()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }

    /// The slice external readers should display: frozen snapshot when
    /// frozen, otherwise the live slice (spec §4.7 "Freeze semantics").
    pub fn displayed_slice(&self) -> Option<OrderbookSlice> {
        if self.is_frozen() {
            self.frozen_slice()
        } else {
            self.live_slice()
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    pub fn error(&self) -> Option<String> {
        self.error.get()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.get()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.get()
    }

    pub fn sync_mode(&self) -> Option<SyncMode> {
        self.sync_mode.get()
    }

    /// Updates the live slice; continues silently even while frozen
    /// (spec §4.7: "incoming live slices continue to update live_slice
    /// silently").
    pub fn update_live(&self, slice: OrderbookSlice) {
        self.live_slice.set(Some(slice));
    }

    /// Captures the current live slice into the frozen slot and sets
    /// the flag (spec §4.7 "freeze()").
    pub fn freeze(&self) {
        let current = self.live_slice.get();
        self.frozen_slice.set(current);
        self.frozen.set(true);
    }

    /// Clears the frozen reference and flag (spec §4.7 "unfreeze()").
    pub fn unfreeze(&self) {
        self.frozen.set(false);
        self.frozen_slice.set(None);
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        if let ConnectionStatus::Error { message } = &status {
            self.error.set(Some(message.clone()));
        } else {
            self.error.set(None);
        }
        self.status.set(status);
    }

    pub fn update_metrics(&self, metrics: Metrics) {
        self.metrics.set(metrics);
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.set(is_leader);
    }

    pub fn set_sync_mode(&self, sync_mode: SyncMode) {
        self.sync_mode.set(Some(sync_mode));
    }

    pub fn subscribe_live_slice(&self) -> watch::Receiver<()> {
        self.live_slice.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<()> {
        self.status.subscribe()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<()> {
        self.metrics.subscribe()
    }
}
