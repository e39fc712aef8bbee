//! Rendering surface interface

use std::io;
use std::time::Duration;

use super::keymapper::KeyEvent;

/// Host-side event delivered to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The window was closed or the process was asked to quit
    CloseRequested,
    Key(KeyEvent),
    /// New grid size in cells
    Resized { cols: u16, rows: u16 },
}

/// Where frames go and where input comes from
///
/// `B` is the backend whose screen state is presented.
pub trait Surface<B> {
    /// Wait up to `timeout` and return at most one pending event
    fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<SurfaceEvent>>;

    /// Present the backend's current screen with the bell overlay
    /// (`0..=BELL_MAX_INTENSITY`, zero for none)
    fn present(&mut self, backend: &B, bell_intensity: u16) -> io::Result<()>;

    /// Restore the host; no further calls follow
    fn teardown(&mut self);
}
