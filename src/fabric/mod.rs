//! Distribution Fabric (DF) — spec §4.5.
//!
//! Three interchangeable ways for published slices to reach consumers:
//! [`shared_host`] (one producer, many attached ports), [`leader`]
//! (leader-elected rebroadcast) and [`shared_memory`] (lock-free,
//! version-counter-guarded). A consumer picks one at startup via
//! [`crate::config::Mode`].

pub mod leader;
pub mod shared_host;
pub mod shared_memory;

/// Errors surfaced by any fabric variant (spec §7, "Fabric errors —
/// logged and surfaced as error(msg); the consumer remains functional
/// with a stale slice").
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shared memory isolation capability unavailable")]
    IsolationUnavailable,

    #[error("port channel closed")]
    PortClosed,

    #[error("shared memory region too small: need {need} bytes, have {have}")]
    RegionTooSmall { need: usize, have: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
