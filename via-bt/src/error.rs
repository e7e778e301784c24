//! Error types for the Bluetooth core
//!
//! Nothing here propagates past the reconcilers; every failure is terminal
//! at its own boundary and degrades to "no device shown" / "no track shown".

use thiserror::Error;

/// Result type for Bluetooth core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth core error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Bus transport missing on this platform. Detected once at startup;
    /// the whole core runs in an inert no-op mode afterwards.
    #[error("Bus transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A specific bus call failed (object vanished, method raised).
    /// Polling skips the tick; player-bound reads demote to Idle.
    #[error("Bus call failed: {0}")]
    RemoteFault(String),

    /// Album art lookup failed. No retry; the next track change is the
    /// natural retry trigger.
    #[error("Art lookup failed: {0}")]
    Enrichment(String),

    /// Adapter setup or agent registration failed. Logged, never blocks
    /// startup or later polling.
    #[error("Adapter bootstrap failed: {0}")]
    Bootstrap(String),
}

impl Error {
    pub(crate) fn remote_fault(err: impl std::fmt::Display) -> Self {
        Error::RemoteFault(err.to_string())
    }

    pub(crate) fn bootstrap(err: impl std::fmt::Display) -> Self {
        Error::Bootstrap(err.to_string())
    }
}
