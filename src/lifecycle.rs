//! Shell-side glue binding window lifecycle hooks to the session core.
//!
//! The window-chrome manager calls [`TerminalShell::window_opened`] with the
//! widget's render surface when it creates a window, wires the widget's
//! keystroke and resize callbacks to the returned handle, and calls
//! [`TerminalShell::window_closed`] from its close hook. Everything else
//! (discovery, choice, reconnect, teardown) happens inside the controller.

use std::sync::Arc;

use crate::controller::{ConnectionController, ControllerHandle, InstanceStatus};
use crate::error::RegistryError;
use crate::negotiator::ReconnectNegotiator;
use crate::persist::SessionStore;
use crate::registry::SessionRegistry;
use crate::surface::RenderSurface;
use crate::transport::Transport;

/// One desktop shell's terminal subsystem: shared collaborators plus the
/// registry of live instances.
pub struct TerminalShell {
    transport: Arc<dyn Transport>,
    negotiator: Arc<dyn ReconnectNegotiator>,
    store: Arc<dyn SessionStore>,
    registry: SessionRegistry,
}

impl TerminalShell {
    pub fn new(
        transport: Arc<dyn Transport>,
        negotiator: Arc<dyn ReconnectNegotiator>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            transport,
            negotiator,
            store,
            registry: SessionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Window-open hook: register and spawn a controller for `window_id`.
    ///
    /// Fails with [`RegistryError::DuplicateWindow`] if the window already
    /// has one; this is a caller bug, not a recoverable runtime condition.
    pub fn window_opened(
        &self,
        window_id: &str,
        surface: Box<dyn RenderSurface>,
    ) -> Result<ControllerHandle, RegistryError> {
        self.registry.register(window_id, || {
            ConnectionController::spawn(
                window_id.to_string(),
                self.transport.clone(),
                surface,
                self.negotiator.clone(),
                self.store.clone(),
            )
        })
    }

    /// Window-close hook: unregister the instance and drive it to `Closed`.
    /// The controller clears the window's persisted record and releases the
    /// surface on the way down. No-op for an unknown window.
    pub async fn window_closed(&self, window_id: &str) {
        if let Some(handle) = self.registry.unregister(window_id) {
            handle.close().await;
        }
    }

    /// Status snapshot for a window, for chrome-level display (title bars,
    /// status lines).
    pub fn status(&self, window_id: &str) -> Option<InstanceStatus> {
        self.registry.get(window_id).map(|handle| handle.status())
    }

    /// Full-shell shutdown: close every instance.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
