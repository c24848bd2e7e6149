//! Transport Client (TC) — spec §4.1.
//!
//! Owns a single streaming WebSocket session against the exchange,
//! reconnecting under a capped exponential backoff with jitter, and
//! emits parsed [`RawDelta`]s. Runs only under the `live` feature since
//! it requires a socket and an async runtime.

use async_stream::stream;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;

use crate::model::RawDelta;

pub mod backoff {
    //! Capped exponential backoff with jitter (spec §4.1):
    //! `delay(n) = min(BASE * 2^(n-1) + U(0, 1s), 30s)`.
    use rand::Rng;
    use std::time::Duration;

    pub const BASE: Duration = Duration::from_secs(1);
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: u32 = 5;

    /// Delay before reconnect attempt `attempt` (1-indexed).
    pub fn delay(attempt: u32) -> Duration {
        let exp = BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        let total_ms = exp.saturating_add(jitter_ms);
        Duration::from_millis(total_ms).min(MAX_DELAY)
    }
}

/// Errors surfaced while establishing or running a streaming session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect: {0}")]
    ConnectFailed(#[from] tungstenite::Error),

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("failed to deserialize frame: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("reconnect attempts exhausted")]
    MaxRetriesExceeded,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Callback events surfaced by the transport, matching spec §4.1's
/// `on_open`/`on_message`/`on_close`/`on_error`/`on_reconnecting`.
#[derive(Debug, Clone)]
pub enum Event {
    Open,
    Message(RawDelta),
    Close,
    Error(String),
    Reconnecting { attempt: u32 },
}

#[derive(serde::Deserialize)]
struct DepthUpdateWire {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

/// Parses one inbound text frame. Returns `None` for anything that
/// isn't a depth-update frame (spec §4.1: "accept only frames whose
/// event-type tag identifies a depth update ... silently discard
/// others"). A frame that parses as JSON but isn't shaped like a depth
/// update is not an error; only malformed JSON is.
fn parse_frame(text: &str) -> Result<Option<RawDelta>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("e").and_then(|v| v.as_str()) != Some("depthUpdate") {
        tracing::debug!("discarding non-depth frame");
        return Ok(None);
    }
    match serde_json::from_value::<DepthUpdateWire>(value) {
        Ok(wire) if wire.event_type == "depthUpdate" => Ok(Some(RawDelta {
            first_update_id: wire.first_update_id,
            final_update_id: wire.final_update_id,
            symbol: wire.symbol,
            bids: wire.bids,
            asks: wire.asks,
        })),
        _ => Ok(None),
    }
}

/// The Transport Client (spec §4.1).
pub struct Client {
    url: String,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// A clone of the cancellation token guarding this client's
    /// reconnect loop. Cancelling it is equivalent to calling
    /// [`Client::disconnect`] from outside, without needing `&mut`
    /// access while [`Client::connect`]'s stream is live.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Suppresses any pending reconnect and causes the stream returned
    /// by [`Client::connect`] to end gracefully on its next poll (spec
    /// §4.1 `disconnect()`).
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Opens a session and reconnects under the backoff ladder in
    /// §4.1 on unexpected close, yielding [`Event`]s until
    /// [`Client::disconnect`] is called or the retry ladder is
    /// exhausted.
    pub fn connect(&self) -> impl Stream<Item = Event> + '_ {
        stream! {
            let mut attempt: u32 = 0;

            'reconnect: loop {
                if self.cancel.is_cancelled() {
                    break 'reconnect;
                }

                let ws_stream = tokio::select! {
                    _ = self.cancel.cancelled() => break 'reconnect,
                    res = connect_async(&self.url) => res,
                };

                let mut ws_stream = match ws_stream {
                    Ok((stream, _)) => {
                        attempt = 0;
                        stream
                    }
                    Err(err) => {
                        attempt += 1;
                        yield Event::Error(err.to_string());
                        if attempt >= backoff::MAX_ATTEMPTS {
                            yield Event::Error("reconnect attempts exhausted".to_string());
                            break 'reconnect;
                        }
                        yield Event::Reconnecting { attempt };
                        tokio::select! {
                            _ = self.cancel.cancelled() => break 'reconnect,
                            _ = tokio::time::sleep(backoff::delay(attempt)) => {}
                        }
                        continue 'reconnect;
                    }
                };

                yield Event::Open;

                loop {
                    let next = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            let _ = ws_stream.close(None).await;
                            break 'reconnect;
                        }
                        msg = ws_stream.next() => msg,
                    };

                    match next {
                        Some(Ok(tungstenite::Message::Text(text))) => match parse_frame(&text) {
                            Ok(Some(delta)) => yield Event::Message(delta),
                            Ok(None) => {}
                            Err(err) => tracing::debug!("discarding unparsable frame: {}", err),
                        },
                        Some(Ok(tungstenite::Message::Ping(_))) => {
                            ws_stream.send(tungstenite::Message::Pong(vec![])).await.ok();
                        }
                        Some(Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_))) => {}
                        Some(Ok(tungstenite::Message::Binary(_))) => {}
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            yield Event::Close;
                            break;
                        }
                        Some(Err(err)) => {
                            yield Event::Error(err.to_string());
                            yield Event::Close;
                            break;
                        }
                    }
                }

                if self.cancel.is_cancelled() {
                    break 'reconnect;
                }
                attempt += 1;
                if attempt >= backoff::MAX_ATTEMPTS {
                    yield Event::Error("reconnect attempts exhausted".to_string());
                    break 'reconnect;
                }
                yield Event::Reconnecting { attempt };
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(backoff::delay(attempt)) => {}
                }
            }
        }
    }
}
