//! Adapter boundary for the terminal-emulator widget.

use crate::protocol::Geometry;

/// The rendering surface as seen by the session core.
///
/// The core only ever writes text to it and reads its geometry; escape
/// sequences pass through untouched. Keystrokes and resizes travel the other
/// way via [`crate::controller::ControllerHandle::input`] and
/// [`crate::controller::ControllerHandle::resize`], wired up by whoever owns
/// the widget.
pub trait RenderSurface: Send {
    /// Write a chunk of terminal output (or a status line) verbatim.
    fn write(&self, text: &str);

    /// Current size of the widget in character cells.
    fn geometry(&self) -> Geometry;

    /// Release the widget. Called exactly once, during teardown.
    fn dispose(&mut self);
}
