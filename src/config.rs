//! Single-process configuration (spec §6.1).
//!
//! This is a plain value object. Parsing it out of a URL query string,
//! theming, and the rest of the presentation layer are external
//! collaborators per spec §1 and live outside this crate.

use serde::{Deserialize, Serialize};

fn default_depth() -> u32 {
    15
}

/// Selects which [`crate::fabric`] variant a consumer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// A single owning process fans slices out via copy-on-send messages.
    Shared,
    /// One consumer is elected leader and rebroadcasts to peers.
    Broadcast,
    /// Lock-free transport over a version-guarded shared region.
    SharedMemory,
}

impl Mode {
    /// Resolves the default mode per spec §6.1: `shared` when a shared
    /// host is available, `broadcast` otherwise. Detecting availability
    /// is environment-specific and owned by the embedding application
    /// (spec §1 boundary), so it is passed in rather than probed here.
    pub fn resolve_default(is_shared_host_available: bool) -> Self {
        if is_shared_host_available {
            Mode::Shared
        } else {
            Mode::Broadcast
        }
    }
}

/// Selects an [`Endpoints`] quadruple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Spot,
    Futures,
}

/// The endpoint quadruple for one [`ExchangeKind`] (spec §6.1 table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ws_url: &'static str,
    pub rest_url: &'static str,
    pub suffix: &'static str,
    pub symbol: &'static str,
}

impl ExchangeKind {
    /// Returns the endpoint quadruple for this exchange.
    pub fn endpoints(&self) -> Endpoints {
        match self {
            ExchangeKind::Spot => Endpoints {
                ws_url: "wss://stream.binance.us:9443/ws",
                rest_url: "https://api.binance.us/api/v3/depth",
                suffix: "@depth@100ms",
                symbol: "BTCUSD",
            },
            ExchangeKind::Futures => Endpoints {
                ws_url: "wss://fstream.binance.com/ws",
                rest_url: "https://fapi.binance.com/fapi/v1/depth",
                suffix: "@depth",
                symbol: "BTCUSDT",
            },
        }
    }

    /// Builds the streaming URL `{base_ws_url}/{lowercased_symbol}{suffix}`.
    pub fn stream_url(&self) -> String {
        let e = self.endpoints();
        format!("{}/{}{}", e.ws_url, e.symbol.to_lowercase(), e.suffix)
    }
}

/// Recognized configuration options (spec §6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub exchange: ExchangeKind,
    #[serde(default = "default_depth")]
    pub depth: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Broadcast,
            exchange: ExchangeKind::Spot,
            depth: default_depth(),
        }
    }
}
