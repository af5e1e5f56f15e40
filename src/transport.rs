//! Adapter boundary for the bidirectional event channel.
//!
//! The channel itself (framing, reconnect, backoff) lives outside this crate;
//! implementations wrap whatever the embedding shell uses. The crate ships
//! one implementation, [`crate::host::LoopbackTransport`], which serves the
//! contract in-process for tests and embedding without a network.

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::protocol::{ClientEvent, ClientRequest, ServerEvent, ServerReply};

/// Everything a transport can hand to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The underlying channel (re)connected.
    Up,
    /// The underlying channel dropped; the transport is retrying on its own.
    Down,
    /// A server push event.
    Server(ServerEvent),
}

/// The event channel as seen by the session core.
///
/// `emit` is fire-and-forget; `request` resolves once the server acknowledges
/// (or the transport gives up). Push events fan out to every subscriber;
/// consumers filter by session tag.
pub trait Transport: Send + Sync {
    fn emit(&self, event: ClientEvent);

    fn request(
        &self,
        request: ClientRequest,
    ) -> BoxFuture<'static, Result<ServerReply, TransportError>>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
