//! Process-wide map from window identity to its connection controller.
//!
//! The registry is the only structure shared across instances. It is owned by
//! whoever constructs the desktop shell and passed by reference, never a
//! hidden global, so multi-shell and test scenarios stay possible.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::controller::ControllerHandle;
use crate::error::RegistryError;

/// At-most-one controller per window.
#[derive(Default)]
pub struct SessionRegistry {
    instances: Mutex<HashMap<String, ControllerHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller for `window_id`, building it with `build` only
    /// if the slot is vacant.
    ///
    /// The duplicate check and the insert happen under one lock with no
    /// suspension point between them, and the builder runs inside that
    /// window, so a duplicate registration can never construct a second
    /// controller.
    pub fn register<F>(&self, window_id: &str, build: F) -> Result<ControllerHandle, RegistryError>
    where
        F: FnOnce() -> ControllerHandle,
    {
        let mut instances = self.instances.lock();
        if instances.contains_key(window_id) {
            return Err(RegistryError::DuplicateWindow(window_id.to_string()));
        }
        let handle = build();
        instances.insert(window_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, window_id: &str) -> Option<ControllerHandle> {
        self.instances.lock().get(window_id).cloned()
    }

    /// Remove the mapping for `window_id`. No-op if absent.
    pub fn unregister(&self, window_id: &str) -> Option<ControllerHandle> {
        self.instances.lock().remove(window_id)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Drive every registered controller to `Closed` and clear the map.
    /// Used for full-shell shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<ControllerHandle> = {
            let mut instances = self.instances.lock();
            instances.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }
}
