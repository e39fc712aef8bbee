//! Unix pseudo-terminal wrapper
//!
//! This module owns one master/slave PTY pair and the shell attached to the
//! slave side. The parent only ever touches the master; the slave is handed
//! to the child and closed in the parent right after the fork.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{read, write, Pid};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Geometry;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Could not open a PTY: {0}")]
    Unavailable(#[source] nix::Error),

    #[error("Failed to spawn shell: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("A process is already attached to the PTY")]
    AlreadySpawned,

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] Errno),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] Errno),

    #[error("Failed to resize PTY: {0}")]
    Resize(#[source] Errno),

    #[error("Failed to configure PTY master: {0}")]
    Configure(#[source] Errno),

    #[error("Failed to reap child process: {0}")]
    Reap(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Window size pushed to the kernel, in cells and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl From<Geometry> for PtySize {
    fn from(geometry: Geometry) -> Self {
        Self {
            cols: geometry.cols,
            rows: geometry.rows,
            pixel_width: geometry.pixel_width(),
            pixel_height: geometry.pixel_height(),
        }
    }
}

impl PtySize {
    fn winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

/// Program started on the slave side
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of one read attempt on the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the front of the buffer
    Data(usize),
    /// The child side is gone; the session is over
    EndOfStream,
    /// Nothing available right now
    WouldBlock,
    /// A signal interrupted the read
    Interrupted,
}

impl ReadOutcome {
    /// Retry on the next attempt rather than ending the session
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReadOutcome::WouldBlock | ReadOutcome::Interrupted)
    }
}

/// Result of one non-blocking write attempt on the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes accepted by the kernel (may be fewer than offered)
    Written(usize),
    /// Nothing was written this attempt
    WouldBlock,
}

/// A PTY pair and the shell attached to its slave
pub struct PtySession {
    master: OwnedFd,
    /// Present only between `open` and `spawn_shell`
    slave: Option<OwnedFd>,
    child: Mutex<Option<Child>>,
    child_pid: Option<u32>,
    size: Mutex<PtySize>,
}

impl PtySession {
    /// Allocate a master/slave pair sized to `size`
    pub fn open(size: PtySize) -> Result<Self> {
        let winsize = size.winsize();
        let pty = openpty(&winsize, None).map_err(PtyError::Unavailable)?;
        // Keep both ends out of every other child; dup2 in `spawn_shell`
        // clears the flag on the slave's stdio copies.
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;
        debug!(
            "Opened PTY {}x{} ({}x{} px)",
            size.cols, size.rows, size.pixel_width, size.pixel_height
        );

        Ok(Self {
            master: pty.master,
            slave: Some(pty.slave),
            child: Mutex::new(None),
            child_pid: None,
            size: Mutex::new(size),
        })
    }

    /// Fork the shell onto the slave side and return its pid
    ///
    /// In the child the slave becomes the controlling terminal of a new
    /// session, gets the window size, and replaces stdin/stdout/stderr before
    /// the program is executed. The parent drops its slave handle immediately
    /// so end-of-output is observable on the master.
    pub fn spawn_shell(&mut self, command: &ShellCommand) -> Result<u32> {
        if self.child_pid.is_some() {
            return Err(PtyError::AlreadySpawned);
        }
        let slave = self.slave.take().ok_or(PtyError::AlreadySpawned)?;

        let slave_fd = slave.as_raw_fd();
        let master_fd = self.master.as_raw_fd();
        let winsize = self.size().winsize();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        // SAFETY: pre_exec runs in the forked child before exec. Only
        // async-signal-safe calls are made (setsid, ioctl, dup2, close) and
        // every captured value is a plain Copy integer or struct.
        let child = unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSWINSZ as libc::c_ulong, &winsize) == -1 {
                    return Err(io::Error::last_os_error());
                }
                for target in 0..=2 {
                    if libc::dup2(slave_fd, target) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                libc::close(master_fd);
                Ok(())
            })
            .spawn()
            .map_err(PtyError::SpawnFailed)?
        };

        drop(slave);
        set_nonblocking(&self.master)?;

        let pid = child.id();
        info!("Spawned {} (pid {})", command.program, pid);

        self.child_pid = Some(pid);
        *lock(&self.child) = Some(child);
        Ok(pid)
    }

    /// Current window size
    pub fn size(&self) -> PtySize {
        *lock(&self.size)
    }

    /// Write bytes to the master (input to the shell), never blocking
    pub fn write(&self, data: &[u8]) -> Result<WriteOutcome> {
        if data.is_empty() {
            return Ok(WriteOutcome::Written(0));
        }
        match write(&self.master, data) {
            Ok(n) => Ok(WriteOutcome::Written(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(PtyError::Write(e)),
        }
    }

    /// Read bytes from the master (output from the shell)
    pub fn read(&self, buffer: &mut [u8]) -> Result<ReadOutcome> {
        match read(self.master.as_fd(), buffer) {
            Ok(0) => Ok(ReadOutcome::EndOfStream),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(Errno::EAGAIN) => Ok(ReadOutcome::WouldBlock),
            Err(Errno::EINTR) => Ok(ReadOutcome::Interrupted),
            // Linux reports a closed slave as EIO rather than EOF
            Err(Errno::EIO) => Ok(ReadOutcome::EndOfStream),
            Err(e) => Err(PtyError::Read(e)),
        }
    }

    /// Wait up to `timeout` for the master to become readable
    ///
    /// Hang-up counts as readable so the following read reports end-of-stream.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(PtyError::Read(e)),
        }
    }

    /// Push a new window size to the kernel; the child gets SIGWINCH
    pub fn resize(&self, size: PtySize) -> Result<()> {
        let winsize = size.winsize();
        // SAFETY: the master fd is owned by self and valid; TIOCSWINSZ only
        // reads the winsize struct passed by pointer.
        let rc = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &winsize,
            )
        };
        if rc == -1 {
            return Err(PtyError::Resize(Errno::last()));
        }
        *lock(&self.size) = size;
        debug!("Resized PTY to {}x{}", size.cols, size.rows);
        Ok(())
    }

    /// Terminate and reap the child
    ///
    /// SIGTERM is followed immediately by SIGKILL; no grace period is given.
    /// Safe to call more than once; later calls return `Ok(None)`.
    pub fn terminate(&self) -> Result<Option<ExitStatus>> {
        let Some(mut child) = lock(&self.child).take() else {
            return Ok(None);
        };

        let pid = Pid::from_raw(child.id() as i32);
        for signal in [Signal::SIGTERM, Signal::SIGKILL] {
            if let Err(e) = kill(pid, signal) {
                // ESRCH: already exited, still needs reaping
                if e != Errno::ESRCH {
                    warn!("kill({}, {:?}) failed: {}", pid, signal, e);
                }
            }
        }

        let status = child.wait().map_err(PtyError::Reap)?;
        info!("Child {} exited: {}", pid, status);
        Ok(Some(status))
    }

    /// Terminate the child and release both handles
    pub fn close(self) -> Result<Option<ExitStatus>> {
        let status = self.terminate();
        // Dropping self closes the master (and the slave if never spawned)
        drop(self);
        status
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("PTY teardown: {}", e);
        }
    }
}

fn set_cloexec<Fd: AsFd>(fd: &Fd) -> Result<()> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Configure)?;
    Ok(())
}

fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(PtyError::Configure)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PtyError::Configure)?;
    Ok(())
}

/// Lock ignoring poison; the guarded values stay consistent across panics
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
