//! Durable per-window session records.
//!
//! One record per window: "the user expects this window's terminal to still
//! be this session after a reload". Records are a hint, never authoritative;
//! the server's discovery response decides what actually still exists, so a
//! stale or missing record only falls back to the normal choice flow.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Storage for per-window session records.
///
/// Records exist while their controller is connected: written on every
/// successful create/reconnect, removed on close. Implementations must
/// survive a shell reload (teardown and re-creation of the shell object);
/// surviving a process restart is not required.
pub trait SessionStore: Send + Sync {
    fn save(&self, window_id: &str, session_id: &str);
    fn load(&self, window_id: &str) -> Option<String>;
    fn clear(&self, window_id: &str);
}

/// The one place record keys are derived, so the one-record-per-window
/// invariant stays checkable here.
pub fn record_key(window_id: &str) -> String {
    format!("terminal.session.{window_id}")
}

/// In-process record store shared across shell reloads.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, window_id: &str, session_id: &str) {
        self.records
            .lock()
            .insert(record_key(window_id), session_id.to_string());
    }

    fn load(&self, window_id: &str) -> Option<String> {
        self.records.lock().get(&record_key(window_id)).cloned()
    }

    fn clear(&self, window_id: &str) {
        self.records.lock().remove(&record_key(window_id));
    }
}
