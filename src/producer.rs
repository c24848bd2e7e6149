//! Producer Host (PH) — spec §4.4.
//!
//! Composes [`crate::transport::Client`], [`crate::sequence::SequenceManager`]
//! and [`crate::book::BookEngine`] into one lifecycle: connect, disconnect,
//! set-depth, visibility. Owns the cadence tick that polls `BookEngine`'s
//! dirty flag and publishes fresh slices while synchronized.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::book::BookEngine;
use crate::model::{ConnectionStatus, OrderbookSlice};
use crate::sequence::{SequenceEvent, SequenceManager, SnapshotSource};
use crate::transport::{self, Client as TransportClient};

/// Cadence at which the book is polled for a fresh slice while
/// synchronized (spec §4.4, "~100ms").
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Messages accepted by the producer host (spec §6.2, consumer→producer).
#[derive(Debug, Clone)]
pub enum Control {
    Connect,
    Disconnect,
    Ping,
    Visibility { hidden: bool },
    SetDepth { depth: u32 },
}

/// Messages the producer host emits (spec §6.2, producer→consumer),
/// restricted to what PH itself decides; fabric-specific framing (e.g.
/// `shared_memory_ready`) is layered on by [`crate::fabric`].
#[derive(Debug, Clone)]
pub enum Output {
    OrderbookUpdate {
        data: OrderbookSlice,
        producer_timestamp_ms: u64,
    },
    StatusChange {
        status: ConnectionStatus,
        error: Option<String>,
    },
}

/// The Producer Host (spec §4.4). Generic over the snapshot source so
/// tests can substitute a fake REST endpoint.
pub struct ProducerHost<S: SnapshotSource> {
    transport: TransportClient,
    sequence: SequenceManager<S>,
    book: BookEngine,
    control_rx: mpsc::UnboundedReceiver<Control>,
    control_tx: mpsc::UnboundedSender<Control>,
    output_tx: mpsc::UnboundedSender<Output>,
    hidden: bool,
    status: ConnectionStatus,
    cancel: CancellationToken,
}

impl<S: SnapshotSource + Send + Sync + 'static> ProducerHost<S> {
    pub fn new(
        stream_url: impl Into<String>,
        source: S,
        symbol: impl Into<String>,
        depth: u32,
        output_tx: mpsc::UnboundedSender<Output>,
    ) -> Self {
        let symbol = symbol.into();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            transport: TransportClient::new(stream_url),
            sequence: SequenceManager::new(source, symbol),
            book: BookEngine::new(depth),
            control_rx,
            control_tx,
            output_tx,
            hidden: false,
            status: ConnectionStatus::Disconnected,
            cancel: CancellationToken::new(),
        }
    }

    /// A sender for posting control messages from outside the host's
    /// run loop (spec §6.2).
    pub fn control_sender(&self) -> mpsc::UnboundedSender<Control> {
        self.control_tx.clone()
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status.clone();
            let error = if let ConnectionStatus::Error { message } = &status {
                Some(message.clone())
            } else {
                None
            };
            let _ = self.output_tx.send(Output::StatusChange { status, error });
        }
    }

    /// Runs the host until `Control::Disconnect` or external
    /// cancellation (spec §5, "the cadence interval is cleared before
    /// tearing down BE to guarantee no post-teardown publish").
    pub async fn run(mut self) {
        use futures_util::StreamExt;

        self.set_status(ConnectionStatus::Connecting);
        let transport_stream = self.transport.connect();
        futures_util::pin_mut!(transport_stream);

        let mut tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.transport.disconnect();
                    break;
                }
                control = self.control_rx.recv() => {
                    match control {
                        Some(Control::Disconnect) | None => {
                            self.transport.disconnect();
                            self.set_status(ConnectionStatus::Disconnected);
                            break;
                        }
                        Some(Control::Connect) => {}
                        Some(Control::Ping) => {}
                        Some(Control::Visibility { hidden }) => {
                            self.hidden = hidden;
                        }
                        Some(Control::SetDepth { depth }) => {
                            self.book.set_depth(depth);
                        }
                    }
                }
                event = transport_stream.next() => {
                    match event {
                        Some(transport::Event::Open) => {
                            self.sequence.reset();
                            self.set_status(self.sequence.status());
                        }
                        Some(transport::Event::Message(delta)) => {
                            let events = self.sequence.on_delta(delta, &mut self.book);
                            for ev in events {
                                if ev == SequenceEvent::Synchronized {
                                    self.set_status(ConnectionStatus::Connected);
                                }
                            }
                            if !self.sequence.is_synchronized() {
                                self.set_status(self.sequence.status());
                            }
                        }
                        Some(transport::Event::Reconnecting { attempt }) => {
                            self.sequence.reset();
                            self.set_status(ConnectionStatus::Reconnecting);
                            tracing::debug!("reconnect attempt {}", attempt);
                        }
                        Some(transport::Event::Close) => {
                            self.sequence.reset();
                        }
                        Some(transport::Event::Error(message)) => {
                            self.set_status(ConnectionStatus::Error { message });
                        }
                        None => break,
                    }
                }
                outcome = self.sequence.wait_fetch() => {
                    let events = self.sequence.handle_fetch_result(outcome, &mut self.book);
                    for ev in events {
                        if ev == SequenceEvent::Synchronized {
                            self.set_status(ConnectionStatus::Connected);
                        }
                    }
                    if !self.sequence.is_synchronized() {
                        self.set_status(self.sequence.status());
                    }
                }
                _ = tick.tick() => {
                    if self.sequence.is_synchronized() && self.book.take_dirty() {
                        let slice = self.book.get_slice();
                        let _ = self.output_tx.send(Output::OrderbookUpdate {
                            data: slice,
                            producer_timestamp_ms: now_ms(),
                        });
                    }
                }
            }
        }
    }

    /// A token that, when cancelled, stops [`ProducerHost::run`] on its
    /// next poll.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RawDelta, Snapshot};
    use crate::sequence::Result as SeqResult;

    struct ImmediateSource;

    #[async_trait::async_trait]
    impl SnapshotSource for ImmediateSource {
        async fn fetch_snapshot(&self, _symbol: &str) -> SeqResult<Snapshot> {
            Ok(Snapshot {
                last_update_id: 0,
                bids: vec![],
                asks: vec![],
            })
        }
    }

    #[tokio::test]
    async fn set_depth_before_run_is_applied_to_book() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let host = ProducerHost::new(
            "wss://example.invalid/ws",
            ImmediateSource,
            "BTCUSDT",
            15,
            tx,
        );
        let control = host.control_sender();
        control.send(Control::SetDepth { depth: 5 }).unwrap();
        control.send(Control::Disconnect).unwrap();
        host.run().await;
    }

    #[test]
    fn raw_delta_survives_reconstruction() {
        // Sanity check that Control/Output don't require anything beyond
        // what model.rs already exports.
        let delta = RawDelta {
            first_update_id: 1,
            final_update_id: 2,
            symbol: "BTCUSDT".to_string(),
            bids: vec![],
            asks: vec![],
        };
        assert_eq!(delta.final_update_id, 2);
    }
}
