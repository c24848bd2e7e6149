//! Sequence-synchronized order-book ingestion and multi-consumer depth
//! distribution for a single trading instrument.
//!
//! The crate decomposes into seven components, data flowing leaves-up:
//! a [`transport`] client that maintains the exchange stream, a
//! [`sequence`] manager that reconciles it against a REST snapshot, a
//! [`book`] engine that maintains sorted price levels and emits
//! top-N slices, a [`producer`] host that composes the three, a
//! [`fabric`] of interchangeable distribution transports, a
//! frame-synchronized [`bridge`] on each consumer, and a reactive
//! [`store`] of the latest slice and connection status.
//!
//! [`book`], [`model`], [`config`] and [`store`] have no network or
//! runtime dependency and compile under the crate's default features,
//! suitable for backtesting or embedding in a process that supplies
//! its own transport. The `live` feature adds [`sequence`],
//! [`transport`], [`producer`] and [`fabric`], which require an async
//! runtime and real sockets.

pub mod book;
pub mod bridge;
pub mod config;
pub mod model;
pub mod store;

#[cfg(feature = "live")]
pub mod error;
#[cfg(feature = "live")]
pub mod fabric;
#[cfg(feature = "live")]
pub mod producer;
#[cfg(feature = "live")]
pub mod sequence;
#[cfg(feature = "live")]
pub mod transport;

pub use book::BookEngine;
pub use config::Config;
pub use store::Store;

#[cfg(feature = "live")]
pub use error::{Error, Result};
#[cfg(feature = "live")]
pub use producer::ProducerHost;
