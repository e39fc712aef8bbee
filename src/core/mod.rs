//! Session I/O core.
//!
//! - **pty**: Unix pseudo-terminal pair and the shell attached to it
//! - **reader**: PTY output source (reader thread or inline polling)
//! - **relay**: Main loop coupling the PTY, the backend, and the surface
//! - **backend**: Terminal backend interface and the vt100 adapter
//! - **bell**: Visual bell pulse
//!
//! # Architecture
//!
//! ```text
//! Relay
//! ├── PtySession (master fd + shell process)
//! ├── OutputSource (reader thread or inline reads)
//! ├── TerminalBackend (vt100 screen + notifications)
//! ├── BellState
//! └── Surface (host terminal)
//! ```

pub mod backend;
pub mod bell;
pub mod pty;
pub mod reader;
pub mod relay;
