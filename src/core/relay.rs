//! I/O relay loop
//!
//! Couples the PTY session, the terminal backend, and the rendering surface.
//! Every iteration handles at most one host event, drains the PTY output
//! that is available into the backend, and presents a frame. Closing the
//! window or reaching the end of the shell's output both lead to a single
//! teardown that kills the shell and releases every resource.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::backend::{TerminalBackend, TerminalEvent};
use super::bell::BellState;
use super::pty::{PtyError, PtySession, PtySize, ShellCommand, WriteOutcome};
use super::reader::{OutputSource, SourceStatus};
use crate::config::{Config, Geometry, ReaderMode};
use crate::ui::keymapper::{KeyEvent, KeyMapper};
use crate::ui::surface::{Surface, SurfaceEvent};

/// Failures that abort startup
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Rendering surface failed: {0}")]
    Surface(#[source] io::Error),

    #[error("Terminal backend failed: {0}")]
    Backend(String),

    #[error("Could not start the PTY reader: {0}")]
    Worker(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Why the relay left `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    WindowClosed,
    SessionEnded,
}

/// What happened to the bytes of one key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDispatch {
    /// Unmapped key; nothing was written
    Ignored,
    Written(usize),
    /// This many bytes could not be written and were discarded
    Dropped(usize),
}

/// Everything the relay needs to start a session
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub shell: ShellCommand,
    pub geometry: Geometry,
    pub reader: ReaderMode,
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    pub bell_duration: Duration,
    pub key_mapper: KeyMapper,
}

impl RelayOptions {
    pub fn from_config(config: &Config, geometry: Geometry) -> Self {
        let mut shell = ShellCommand::new(&config.shell).env("TERM", &config.term);
        for arg in &config.shell_args {
            shell = shell.arg(arg);
        }

        Self {
            shell,
            geometry,
            reader: config.reader,
            poll_interval: config.poll_interval(),
            read_buffer_size: config.read_buffer_size,
            bell_duration: config.bell_duration(),
            key_mapper: KeyMapper::new(config.alt_sends_escape, config.backspace_sends_delete),
        }
    }
}

pub struct Relay<B: TerminalBackend, S: Surface<B>> {
    state: RelayState,
    exit_reason: Option<ExitReason>,
    /// Shared with the reader thread; `None` once released
    pty: Option<Arc<PtySession>>,
    child_pid: Option<u32>,
    source: OutputSource,
    running: Arc<AtomicBool>,
    backend: B,
    surface: S,
    bell: BellState,
    key_mapper: KeyMapper,
    geometry: Geometry,
    poll_interval: Duration,
}

impl<B: TerminalBackend, S: Surface<B>> Relay<B, S> {
    /// Open the PTY, spawn the shell, start reading, and present the first frame
    pub fn start(options: RelayOptions, backend: B, surface: S) -> Result<Self, StartupError> {
        let mut pty = PtySession::open(PtySize::from(options.geometry))?;
        let child_pid = pty.spawn_shell(&options.shell)?;
        let pty = Arc::new(pty);
        let running = Arc::new(AtomicBool::new(true));

        let source = match options.reader {
            ReaderMode::Background => OutputSource::background(
                pty.clone(),
                running.clone(),
                options.poll_interval,
                options.read_buffer_size,
            )
            .map_err(StartupError::Worker)?,
            ReaderMode::Inline => OutputSource::inline(options.read_buffer_size),
        };

        let mut relay = Self {
            state: RelayState::Starting,
            exit_reason: None,
            pty: Some(pty),
            child_pid: Some(child_pid),
            source,
            running,
            backend,
            surface,
            bell: BellState::new(options.bell_duration),
            key_mapper: options.key_mapper,
            geometry: options.geometry,
            poll_interval: options.poll_interval,
        };

        if let Err(e) = relay.surface.present(&relay.backend, 0) {
            relay.shutdown();
            return Err(StartupError::Surface(e));
        }

        relay.state = RelayState::Running;
        info!(
            "Relay running (shell pid {:?}, {}x{}, {:?} reader)",
            relay.child_pid, relay.geometry.cols, relay.geometry.rows, options.reader
        );
        Ok(relay)
    }

    /// Loop until the window closes or the session ends, then tear down
    pub fn run(&mut self) -> ExitReason {
        while self.step() == RelayState::Running {}
        self.shutdown();
        self.exit_reason.unwrap_or(ExitReason::WindowClosed)
    }

    /// One iteration: host event, PTY output, frame
    pub fn step(&mut self) -> RelayState {
        if self.state != RelayState::Running {
            return self.state;
        }

        match self.surface.poll_event(self.poll_interval) {
            Ok(Some(SurfaceEvent::CloseRequested)) => {
                info!("Close requested");
                self.begin_drain(ExitReason::WindowClosed);
                return self.state;
            }
            Ok(Some(SurfaceEvent::Key(event))) => {
                self.send_key(&event);
            }
            Ok(Some(SurfaceEvent::Resized { cols, rows })) => self.resize(cols, rows),
            Ok(None) => {}
            Err(e) => {
                warn!("Surface event error: {}", e);
                self.begin_drain(ExitReason::WindowClosed);
                return self.state;
            }
        }

        let status = self.drain_output();

        let intensity = self.bell.sample(Instant::now());
        if let Err(e) = self.surface.present(&self.backend, intensity) {
            warn!("Present failed: {}", e);
            self.begin_drain(ExitReason::WindowClosed);
            return self.state;
        }

        if status == SourceStatus::Closed {
            self.begin_drain(ExitReason::SessionEnded);
        }
        self.state
    }

    /// Encode a key press and write it, dropping whatever cannot be written
    pub fn send_key(&mut self, event: &KeyEvent) -> KeyDispatch {
        let bytes = self.key_mapper.encode_event(event);
        if bytes.is_empty() {
            return KeyDispatch::Ignored;
        }
        self.write_input(&bytes)
    }

    /// Change the grid of both the backend and the PTY
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 || (cols, rows) == (self.geometry.cols, self.geometry.rows) {
            return;
        }
        self.geometry = self.geometry.with_grid(cols, rows);
        self.backend.resize(cols, rows);
        if let Some(pty) = &self.pty {
            if let Err(e) = pty.resize(PtySize::from(self.geometry)) {
                warn!("{}", e);
            }
        }
    }

    /// Kill the shell and release everything; idempotent
    pub fn shutdown(&mut self) {
        if self.state == RelayState::Terminated {
            return;
        }
        self.state = RelayState::Draining;
        self.running.store(false, Ordering::SeqCst);

        if let Some(pty) = &self.pty {
            match pty.terminate() {
                Ok(Some(status)) => info!("Shell exited: {}", status),
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }
        self.source.join();

        if let Some(pty) = self.pty.take() {
            // The reader has exited, so this is the last reference
            if let Ok(pty) = Arc::try_unwrap(pty) {
                if let Err(e) = pty.close() {
                    warn!("{}", e);
                }
            }
        }

        self.surface.teardown();
        self.backend.shutdown();
        self.state = RelayState::Terminated;
        debug!("Relay terminated");
    }

    #[cfg(test)]
    pub fn state(&self) -> RelayState {
        self.state
    }

    #[cfg(test)]
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    pub fn surface(&self) -> &S {
        &self.surface
    }

    #[cfg(test)]
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    fn begin_drain(&mut self, reason: ExitReason) {
        self.exit_reason.get_or_insert(reason);
        self.state = RelayState::Draining;
    }

    /// Feed all available output to the backend and act on its notifications
    fn drain_output(&mut self) -> SourceStatus {
        let Some(pty) = self.pty.as_deref() else {
            return SourceStatus::Closed;
        };

        let backend = &mut self.backend;
        let mut events = Vec::new();
        let status = self.source.drain(pty, &mut |bytes| {
            backend.feed(bytes, &mut |event| events.push(event));
        });

        let now = Instant::now();
        for event in events {
            self.handle_event(event, now);
        }
        status
    }

    fn handle_event(&mut self, event: TerminalEvent, now: Instant) {
        debug!("Backend event: {:?}", event);
        let reply = match event {
            TerminalEvent::Bell => {
                self.bell.trigger(now);
                None
            }
            TerminalEvent::DeviceStatus => Some(b"\x1b[0n".to_vec()),
            TerminalEvent::CursorPositionReport { x, y } => {
                Some(format!("\x1b[{};{}R", u32::from(y) + 1, u32::from(x) + 1).into_bytes())
            }
            TerminalEvent::PrivateId => Some(b"\x1b[?6c".to_vec()),
            TerminalEvent::KeyboardLeds(_) | TerminalEvent::ModeChange { .. } => None,
        };
        if let Some(reply) = reply {
            self.write_input(&reply);
        }
    }

    /// One non-blocking write; no queueing and no retry
    fn write_input(&self, bytes: &[u8]) -> KeyDispatch {
        let Some(pty) = &self.pty else {
            return KeyDispatch::Dropped(bytes.len());
        };
        let dispatch = match pty.write(bytes) {
            Ok(WriteOutcome::Written(n)) if n == bytes.len() => KeyDispatch::Written(n),
            Ok(WriteOutcome::Written(n)) => KeyDispatch::Dropped(bytes.len() - n),
            Ok(WriteOutcome::WouldBlock) => KeyDispatch::Dropped(bytes.len()),
            Err(e) => {
                warn!("{}", e);
                KeyDispatch::Dropped(bytes.len())
            }
        };
        if let KeyDispatch::Dropped(n) = dispatch {
            debug!("Dropped {} input bytes", n);
        }
        dispatch
    }
}

impl<B: TerminalBackend, S: Surface<B>> Drop for Relay<B, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::Vt100Backend;
    use crate::ui::keymapper::{Key, Modifiers};
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::collections::VecDeque;
    use std::thread;

    /// Plays back queued events and records what was presented
    #[derive(Default)]
    struct ScriptedSurface {
        events: VecDeque<SurfaceEvent>,
        frames: usize,
        max_intensity: u16,
        torn_down: bool,
    }

    impl<B> Surface<B> for ScriptedSurface {
        fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<SurfaceEvent>> {
            match self.events.pop_front() {
                Some(event) => Ok(Some(event)),
                None => {
                    thread::sleep(timeout);
                    Ok(None)
                }
            }
        }

        fn present(&mut self, _backend: &B, bell_intensity: u16) -> io::Result<()> {
            self.frames += 1;
            self.max_intensity = self.max_intensity.max(bell_intensity);
            Ok(())
        }

        fn teardown(&mut self) {
            self.torn_down = true;
        }
    }

    /// Keeps every fed byte; BEL raises a bell notification
    #[derive(Default)]
    struct RecordingBackend {
        fed: Vec<u8>,
        resized: Option<(u16, u16)>,
        shut_down: bool,
    }

    impl RecordingBackend {
        fn output(&self) -> String {
            String::from_utf8_lossy(&self.fed).into_owned()
        }
    }

    impl TerminalBackend for RecordingBackend {
        fn feed(&mut self, bytes: &[u8], notify: &mut dyn FnMut(TerminalEvent)) {
            self.fed.extend_from_slice(bytes);
            if bytes.contains(&0x07) {
                notify(TerminalEvent::Bell);
            }
        }

        fn resize(&mut self, cols: u16, rows: u16) {
            self.resized = Some((cols, rows));
        }

        fn shutdown(&mut self) {
            self.shut_down = true;
        }
    }

    fn options(shell: ShellCommand, reader: ReaderMode) -> RelayOptions {
        RelayOptions {
            shell,
            geometry: Geometry::default().with_grid(80, 24),
            reader,
            poll_interval: Duration::from_millis(5),
            read_buffer_size: 4096,
            bell_duration: Duration::from_millis(180),
            key_mapper: KeyMapper::default(),
        }
    }

    fn sh(script: &str) -> ShellCommand {
        ShellCommand::new("/bin/sh").arg("-c").arg(script)
    }

    fn start(
        shell: ShellCommand,
        reader: ReaderMode,
    ) -> Relay<RecordingBackend, ScriptedSurface> {
        Relay::start(
            options(shell, reader),
            RecordingBackend::default(),
            ScriptedSurface::default(),
        )
        .unwrap()
    }

    /// Step until `done` holds or the deadline passes
    fn step_until<B: TerminalBackend, S: Surface<B>>(
        relay: &mut Relay<B, S>,
        mut done: impl FnMut(&Relay<B, S>) -> bool,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if done(relay) {
                return true;
            }
            if relay.step() != RelayState::Running {
                return done(relay);
            }
        }
        false
    }

    fn process_exists(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn key(key: Key) -> SurfaceEvent {
        SurfaceEvent::Key(KeyEvent::new(key, Modifiers::empty()))
    }

    #[test]
    fn test_close_request_terminates_and_kills_child() {
        let mut relay = start(ShellCommand::new("sleep").arg("30"), ReaderMode::Background);
        let pid = relay.child_pid().unwrap();
        assert_eq!(relay.state(), RelayState::Running);
        assert!(process_exists(pid));

        relay.surface_mut().events.push_back(SurfaceEvent::CloseRequested);
        assert_eq!(relay.run(), ExitReason::WindowClosed);

        assert_eq!(relay.state(), RelayState::Terminated);
        assert!(!process_exists(pid));
        assert!(relay.surface().torn_down);
        assert!(relay.backend().shut_down);
    }

    #[test]
    fn test_session_end_is_graceful() {
        for reader in [ReaderMode::Background, ReaderMode::Inline] {
            let mut relay = start(sh("echo session-done"), reader);
            let pid = relay.child_pid().unwrap();

            assert_eq!(relay.run(), ExitReason::SessionEnded);
            assert!(relay.backend().output().contains("session-done"));
            assert!(!process_exists(pid));
        }
    }

    #[test]
    fn test_key_round_trip_reaches_backend() {
        for reader in [ReaderMode::Background, ReaderMode::Inline] {
            let mut relay = start(ShellCommand::new("cat"), reader);
            relay.surface_mut().events.extend([
                key(Key::Letter(b'h')),
                key(Key::Letter(b'i')),
                key(Key::Return),
            ]);

            assert!(step_until(&mut relay, |r| r.backend().output().contains("hi")));
            relay.shutdown();
            assert_eq!(relay.state(), RelayState::Terminated);
        }
    }

    #[test]
    fn test_unmapped_key_writes_nothing() {
        let mut relay = start(ShellCommand::new("cat"), ReaderMode::Background);
        let media = KeyEvent::new(Key::Media, Modifiers::SHIFT);
        assert_eq!(relay.send_key(&media), KeyDispatch::Ignored);

        let ctrl_c = KeyEvent::new(Key::Letter(b'c'), Modifiers::CTRL);
        assert_eq!(relay.send_key(&ctrl_c), KeyDispatch::Written(1));
    }

    #[test]
    fn test_send_after_shutdown_is_dropped() {
        let mut relay = start(ShellCommand::new("cat"), ReaderMode::Inline);
        relay.shutdown();
        let event = KeyEvent::new(Key::Up, Modifiers::empty());
        assert_eq!(relay.send_key(&event), KeyDispatch::Dropped(3));
        assert_eq!(relay.step(), RelayState::Terminated);
    }

    #[test]
    fn test_backpressure_drops_key_bytes() {
        // Nothing reads the terminal, so the input queue fills up.
        let mut relay = start(sh("stty raw -echo; sleep 30"), ReaderMode::Inline);
        thread::sleep(Duration::from_millis(200));

        let event = KeyEvent::new(Key::Letter(b'x'), Modifiers::empty());
        let started = Instant::now();
        let mut dropped = None;
        for _ in 0..1_000_000 {
            if let KeyDispatch::Dropped(n) = relay.send_key(&event) {
                dropped = Some(n);
                break;
            }
        }

        assert_eq!(dropped, Some(1));
        assert!(started.elapsed() < Duration::from_secs(5));
        relay.shutdown();
        assert_eq!(relay.state(), RelayState::Terminated);
    }

    #[test]
    fn test_bell_reaches_the_frame() {
        let mut relay = start(sh("printf '\\a'; sleep 5"), ReaderMode::Background);
        assert!(step_until(&mut relay, |r| r.surface().max_intensity > 0));
        relay.shutdown();
    }

    #[test]
    fn test_resize_updates_backend() {
        let mut relay = start(ShellCommand::new("cat"), ReaderMode::Inline);
        relay.surface_mut().events.push_back(SurfaceEvent::Resized { cols: 100, rows: 30 });
        relay.step();
        assert_eq!(relay.backend().resized, Some((100, 30)));
    }

    #[test]
    fn test_device_status_is_answered() {
        let script = "stty -echo -icanon min 1; printf '\\033[5n'; head -c 4 | od -An -tx1";
        let mut relay = Relay::start(
            options(sh(script), ReaderMode::Background),
            Vt100Backend::new(80, 24, 0).unwrap(),
            ScriptedSurface::default(),
        )
        .unwrap();

        assert!(step_until(&mut relay, |r| r
            .backend()
            .screen()
            .contents()
            .contains("1b 5b 30 6e")));
        relay.shutdown();
    }

    #[test]
    fn test_spawn_failure_is_startup_error() {
        let result = Relay::start(
            options(ShellCommand::new("/nonexistent/shell"), ReaderMode::Background),
            RecordingBackend::default(),
            ScriptedSurface::default(),
        );
        assert!(matches!(
            result,
            Err(StartupError::Pty(PtyError::SpawnFailed(_)))
        ));
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            shell: "/bin/zsh".to_string(),
            alt_sends_escape: true,
            ..Config::default()
        };
        let opts = RelayOptions::from_config(&config, config.geometry(None));
        assert_eq!(opts.shell.program, "/bin/zsh");
        assert_eq!(opts.shell.args, vec!["-l".to_string()]);
        assert!(opts
            .shell
            .env
            .contains(&("TERM".to_string(), "xterm-256color".to_string())));
        assert!(opts.key_mapper.alt_sends_escape);
        assert_eq!(opts.reader, ReaderMode::Background);
    }
}
