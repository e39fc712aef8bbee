//! ptyterm - a shell in a pseudo-terminal, drawn on the host terminal
//!
//! ptyterm spawns a login shell on a Unix PTY, interprets its output with a
//! vt100 screen model, and redraws that screen on the terminal it was started
//! from. Key presses are encoded into the byte sequences a terminal-aware
//! program expects.
//!
//! # Features
//!
//! - **Real PTY**: job control, Ctrl+C, and window-size changes work as in any
//!   terminal
//! - **Visual bell**: a short fading flash instead of a beep
//! - **Two reader modes**: a dedicated reader thread or inline polling
//!
//! # Quick Start
//!
//! ```text
//! ptyterm            # Start the configured shell (/bin/bash -l by default)
//! ```
//!
//! The session ends when the shell exits or when ptyterm receives SIGHUP,
//! SIGTERM, or SIGINT.

mod config;
#[cfg(unix)]
mod core;
#[cfg(unix)]
mod ui;

use std::env;
use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("ptyterm {}", VERSION);
}

fn print_help() {
    eprintln!("ptyterm {} - A shell in a pseudo-terminal", VERSION);
    eprintln!();
    eprintln!("Usage: ptyterm [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.ptyterm/config.toml");
    eprintln!("Log file:      ~/.ptyterm/ptyterm.log (filter with RUST_LOG)");
    eprintln!();
    eprintln!("Exit: Type 'exit' in the shell");
}

fn parse_args() -> Result<(), String> {
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
    }
    Ok(())
}

/// Log to `~/.ptyterm/ptyterm.log`; the terminal itself is the display
fn init_logging() {
    let Some(dir) = config::data_dir() else {
        return;
    };
    if fs::create_dir_all(&dir).is_err() {
        return;
    }

    // Open log file (append mode)
    let Ok(file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ptyterm.log"))
    else {
        return;
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> anyhow::Result<()> {
    if let Err(e) = parse_args() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_logging();
    info!("ptyterm {} starting...", VERSION);

    if let Err(e) = run_terminal() {
        error!("Startup failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

#[cfg(not(unix))]
fn run_terminal() -> anyhow::Result<()> {
    anyhow::bail!("ptyterm requires a Unix pseudo-terminal")
}

#[cfg(unix)]
fn run_terminal() -> anyhow::Result<()> {
    use anyhow::Context;

    use crate::config::Config;
    use crate::core::backend::Vt100Backend;
    use crate::core::relay::{Relay, RelayOptions, StartupError};
    use crate::ui::renderer::Renderer;
    use crate::ui::signals;

    let config = Config::load();
    signals::install().context("Failed to install signal handlers")?;

    let host_size = Renderer::size().ok();
    let geometry = config.geometry(host_size);
    info!("Shell: {} {:?}", config.shell, config.shell_args);
    info!(
        "Grid: {}x{} ({}x{} px), host size: {:?}",
        geometry.cols,
        geometry.rows,
        geometry.pixel_width(),
        geometry.pixel_height(),
        host_size
    );

    let backend = Vt100Backend::new(geometry.cols, geometry.rows, config.scrollback)
        .map_err(StartupError::Backend)?;

    // A configured grid stays fixed; otherwise it follows the host
    let follow_host_size = config.cols.is_none() && config.rows.is_none();
    let mut renderer = Renderer::new(follow_host_size);
    renderer.init().map_err(StartupError::Surface)?;

    let options = RelayOptions::from_config(&config, geometry);
    let mut relay = Relay::start(options, backend, renderer)?;
    let reason = relay.run();
    info!("Session finished: {:?}", reason);
    Ok(())
}
