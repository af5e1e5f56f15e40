//! Reconnect choice: reclaim a detached session, or start fresh.

use futures::future::BoxFuture;

use crate::protocol::SessionDescriptor;

/// The single decision a negotiator produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    Reconnect { session_id: String },
    CreateNew,
}

/// Presents discovered sessions and resolves to exactly one [`Choice`].
///
/// This is a one-shot choice producer: no retry logic, no timeout (the choice
/// is user-driven and has no forced default). It is never invoked with an
/// empty list -- the controller shortcuts straight to creating a session in
/// that case. Display order is up to the implementation; raw server order is
/// acceptable.
pub trait ReconnectNegotiator: Send + Sync {
    fn present(&self, sessions: Vec<SessionDescriptor>) -> BoxFuture<'static, Choice>;
}

/// Negotiator for embedders that never prompt: always starts a fresh session.
pub struct AutoCreate;

impl ReconnectNegotiator for AutoCreate {
    fn present(&self, _sessions: Vec<SessionDescriptor>) -> BoxFuture<'static, Choice> {
        Box::pin(async { Choice::CreateNew })
    }
}
