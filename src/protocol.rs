//! Typed wire messages for the session event channel.
//!
//! Every message crossing the channel is tagged with a `type` field so the
//! peer can dispatch without peeking at payload shapes. Output, resize and
//! input are additionally tagged with the session id they belong to; a
//! receiver drops anything tagged with a session it does not currently own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A detached server-side session that a client may reclaim.
///
/// Produced only by discovery; never mutated locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub working_dir: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// Fire-and-forget client -> server events. No response is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Input { session_id: String, data: String },
    Resize { session_id: String, cols: u16, rows: u16 },
    /// Best-effort close notification sent when a window goes away.
    Close { session_id: String },
}

/// Acknowledged client -> server requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// List detached sessions available for reattach.
    Discover,
    /// Start a fresh session sized to the current surface.
    Create { cols: u16, rows: u16 },
    /// Reclaim a detached session.
    Reconnect { session_id: String },
}

/// Replies to acknowledged requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Sessions { sessions: Vec<SessionDescriptor> },
    /// Create/reconnect succeeded. The id here is authoritative even when it
    /// differs from the one the client asked for.
    Attached { session_id: String },
    Refused { error: String },
}

/// Server -> client push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Output { session_id: String, data: String },
    Error { session_id: String, error: String },
    /// The session ended on the server side (shell exited, host killed it).
    Closed { session_id: String },
}
