//! Error taxonomy for the session multiplexer.
//!
//! Transport failures never escape the controller: they are turned into state
//! transitions plus a surface message. The only error surfaced to callers as
//! a `Result` is the registry's duplicate-window contract violation.

use thiserror::Error;

/// Failure of an acknowledged transport operation.
///
/// The controller treats every variant uniformly as a connect-failure
/// trigger; the distinction exists for logging and for transports to report
/// honestly.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The event channel is not currently connected.
    #[error("event channel is down")]
    ChannelDown,

    /// The request was sent but never acknowledged (the transport's own
    /// timeout fired, or the channel dropped mid-request).
    #[error("request was not acknowledged: {0}")]
    Ack(String),
}

/// Contract violations of the session registry.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A terminal instance is already registered for this window. This is a
    /// programming error in the caller, not a runtime condition.
    #[error("window {0} already has a registered terminal instance")]
    DuplicateWindow(String),
}
