//! termdock: terminal session multiplexer with detached-session recovery.
//!
//! Manages one PTY client session per window of a multi-window shell,
//! coordinated over a bidirectional event channel. Each window gets a
//! [`controller::ConnectionController`] driving the session lifecycle
//! (discover detached sessions, offer a reconnect choice, create or reclaim,
//! relay input/output/resize, tear down on window close); a
//! [`registry::SessionRegistry`] guarantees at most one instance per window,
//! and a [`persist::SessionStore`] remembers which session a window expects
//! to still own after a reload.
//!
//! The rendering widget, the channel itself, and the window chrome are
//! external collaborators behind the [`surface::RenderSurface`],
//! [`transport::Transport`] and [`lifecycle::TerminalShell`] seams. The
//! [`host`] module provides the server half in-process for embeddings and
//! tests that do not split client from server.

pub mod controller;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod negotiator;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod surface;
pub mod transport;

pub use controller::{ConnectionController, ConnectionState, ControllerHandle, InstanceStatus};
pub use error::{RegistryError, TransportError};
pub use lifecycle::TerminalShell;
pub use negotiator::{Choice, ReconnectNegotiator};
pub use persist::{MemoryStore, SessionStore};
pub use protocol::{Geometry, SessionDescriptor};
pub use registry::SessionRegistry;
pub use surface::RenderSurface;
pub use transport::{Transport, TransportEvent};
