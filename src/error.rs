//! Crate-level error types.
//!
//! Each fallible subsystem gets its own variant group, mirroring the
//! taxonomy in spec §7: transport errors, sequence/snapshot errors, and
//! fabric errors are distinct failure domains that callers generally want
//! to match on separately. Only meaningful once the `live` feature
//! pulls in the I/O-bearing subsystems it aggregates.

/// A helper `Result` type aliased to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error produced by the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The reconnect ladder was exhausted (§4.1); the transport gives up.
    #[error("transport: {0}")]
    Transport(#[from] crate::transport::Error),

    /// Snapshot fetch failed after the retry cap (§4.2).
    #[error("sequence: {0}")]
    Sequence(#[from] crate::sequence::Error),

    /// A distribution fabric failed to deliver or accept a slice (§4.5).
    #[error("fabric: {0}")]
    Fabric(#[from] crate::fabric::Error),

    /// The shared-memory isolation capability required by `Mode::SharedMemory`
    /// is unavailable in this process (§7, terminal condition).
    #[error("shared memory isolation capability unavailable")]
    IsolationUnavailable,
}
