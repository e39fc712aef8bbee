//! Host-side input and rendering.
//!
//! - **keymapper**: Key press to PTY byte sequence mapping
//! - **surface**: Interface the relay presents frames through
//! - **renderer**: Crossterm surface drawing the vt100 screen
//! - **signals**: Close-request signal flags

pub mod keymapper;
pub mod renderer;
pub mod signals;
pub mod surface;
