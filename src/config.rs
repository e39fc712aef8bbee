//! Configuration for ptyterm.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.ptyterm/config.toml`
//! - Grid and pixel geometry derived from the configured cell metrics
//!
//! # Configuration File
//!
//! Every key is optional. A missing file behaves exactly like an empty one.
//!
//! ```toml
//! # Shell to spawn inside the PTY (login shell by default)
//! shell = "/bin/bash"
//! shell_args = ["-l"]
//!
//! # Grid size; defaults to the host terminal size
//! cols = 120
//! rows = 35
//!
//! # Cell metrics used for the pixel size reported to the child
//! glyph_width = 8
//! glyph_height = 16
//!
//! # "background" (reader worker) or "inline" (polled every frame)
//! reader = "background"
//!
//! # Prefix ESC when Alt is held on printable keys
//! alt_sends_escape = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Fallback grid when neither the config nor the host terminal gives a size
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 35;

/// How PTY output is pulled off the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderMode {
    /// Dedicated worker thread polling the master and forwarding chunks
    Background,
    /// Non-blocking reads performed by the main loop once per frame
    Inline,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell program
    pub shell: String,
    /// Shell arguments
    pub shell_args: Vec<String>,
    /// TERM exported to the child
    pub term: String,
    /// Grid columns (None = host terminal width)
    pub cols: Option<u16>,
    /// Grid rows (None = host terminal height)
    pub rows: Option<u16>,
    pub glyph_width: u16,
    pub glyph_height: u16,
    /// Length of the visual bell pulse
    pub bell_duration_ms: u64,
    pub reader: ReaderMode,
    /// Reader poll timeout and frame wait
    pub poll_interval_ms: u64,
    pub read_buffer_size: usize,
    pub alt_sends_escape: bool,
    pub backspace_sends_delete: bool,
    /// Backend scrollback lines
    pub scrollback: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            shell_args: vec!["-l".to_string()],
            term: "xterm-256color".to_string(),
            cols: None,
            rows: None,
            glyph_width: 8,
            glyph_height: 16,
            bell_duration_ms: 180,
            reader: ReaderMode::Background,
            poll_interval_ms: 10,
            read_buffer_size: 4096,
            alt_sends_escape: false,
            backspace_sends_delete: false,
            scrollback: 0,
        }
    }
}

impl Config {
    /// Load configuration from `~/.ptyterm/config.toml`
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load configuration from a specific file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        data_dir().map(|dir| dir.join("config.toml"))
    }

    /// Resolve the grid, preferring configured values over the host size
    pub fn geometry(&self, host_size: Option<(u16, u16)>) -> Geometry {
        let (host_cols, host_rows) = host_size.unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
        Geometry {
            cols: self.cols.unwrap_or(host_cols).max(1),
            rows: self.rows.unwrap_or(host_rows).max(1),
            glyph_width: self.glyph_width,
            glyph_height: self.glyph_height,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn bell_duration(&self) -> Duration {
        Duration::from_millis(self.bell_duration_ms)
    }
}

/// Cell grid plus the glyph metrics used to derive a pixel size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
    pub glyph_width: u16,
    pub glyph_height: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            glyph_width: 8,
            glyph_height: 16,
        }
    }
}

impl Geometry {
    /// Surface width: one spacing pixel after every glyph
    pub fn pixel_width(&self) -> u16 {
        self.cols.saturating_mul(self.glyph_width.saturating_add(1))
    }

    pub fn pixel_height(&self) -> u16 {
        self.rows.saturating_mul(self.glyph_height)
    }

    /// Same glyph metrics, new grid
    pub fn with_grid(self, cols: u16, rows: u16) -> Self {
        Self { cols, rows, ..self }
    }
}

/// `~/.ptyterm`, home of the config file and the log
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ptyterm"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
