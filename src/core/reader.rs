//! PTY output source
//!
//! Output is pulled off the master either by a dedicated reader thread that
//! forwards chunks over a channel, or by non-blocking reads made inline by
//! the main loop. Either way the main loop drains whatever is available once
//! per frame and never blocks on the PTY.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::pty::{PtySession, ReadOutcome};

/// Whether the PTY can still produce output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Open,
    /// End-of-stream or a fatal read error; the session is over
    Closed,
}

/// Reader worker and the receiving end of its channel
pub struct BackgroundReader {
    output_rx: Receiver<Vec<u8>>,
    reader_thread: Option<JoinHandle<()>>,
}

pub enum OutputSource {
    Background(BackgroundReader),
    Inline { buffer: Vec<u8> },
}

impl OutputSource {
    /// Non-blocking reads on the caller's thread
    pub fn inline(buffer_size: usize) -> Self {
        OutputSource::Inline {
            buffer: vec![0u8; buffer_size.max(1)],
        }
    }

    /// Start the reader thread
    ///
    /// The thread waits at most `poll_interval` per cycle, so clearing
    /// `running` stops it within one cycle. It clears `running` itself when
    /// the PTY reaches end-of-stream.
    pub fn background(
        pty: Arc<PtySession>,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        let reader_thread = thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size.max(1)];

                while running.load(Ordering::SeqCst) {
                    match pty.wait_readable(poll_interval) {
                        Ok(false) => continue,
                        Ok(true) => {}
                        Err(e) => {
                            warn!("PTY poll failed: {}", e);
                            break;
                        }
                    }

                    match pty.read(&mut buffer) {
                        Ok(ReadOutcome::Data(n)) => {
                            // Main loop gone
                            if tx.send(buffer[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Ok(outcome) if outcome.is_retryable() => {}
                        Ok(_) => {
                            info!("PTY reached end of output");
                            break;
                        }
                        Err(e) => {
                            warn!("{}", e);
                            break;
                        }
                    }
                }

                running.store(false, Ordering::SeqCst);
                debug!("Reader thread exiting");
            })?;

        Ok(OutputSource::Background(BackgroundReader {
            output_rx: rx,
            reader_thread: Some(reader_thread),
        }))
    }

    /// Hand every chunk available right now to `sink`, in order
    pub fn drain(&mut self, pty: &PtySession, sink: &mut dyn FnMut(&[u8])) -> SourceStatus {
        match self {
            OutputSource::Background(reader) => {
                // Collect first so the channel is drained before feeding
                let mut all_data: Vec<Vec<u8>> = Vec::new();
                let mut status = SourceStatus::Open;
                loop {
                    match reader.output_rx.try_recv() {
                        Ok(data) => all_data.push(data),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            status = SourceStatus::Closed;
                            break;
                        }
                    }
                }
                for data in &all_data {
                    sink(data);
                }
                status
            }
            OutputSource::Inline { buffer } => loop {
                match pty.read(buffer) {
                    Ok(ReadOutcome::Data(n)) => sink(&buffer[..n]),
                    Ok(ReadOutcome::Interrupted) => continue,
                    Ok(ReadOutcome::WouldBlock) => return SourceStatus::Open,
                    Ok(ReadOutcome::EndOfStream) => {
                        info!("PTY reached end of output");
                        return SourceStatus::Closed;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        return SourceStatus::Closed;
                    }
                }
            },
        }
    }

    /// Wait for the reader thread; callers clear `running` first
    pub fn join(&mut self) {
        if let OutputSource::Background(reader) = self {
            if let Some(handle) = reader.reader_thread.take() {
                if handle.join().is_err() {
                    warn!("Reader thread panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Geometry;
    use crate::core::pty::{PtySize, ShellCommand};
    use std::time::Instant;

    fn spawn(command: ShellCommand) -> PtySession {
        let mut pty = PtySession::open(PtySize::from(Geometry::default().with_grid(80, 24))).unwrap();
        pty.spawn_shell(&command).unwrap();
        pty
    }

    /// Drain until closed or timed out, returning everything seen
    fn collect(source: &mut OutputSource, pty: &PtySession, limit: Duration) -> (Vec<u8>, SourceStatus) {
        let start = Instant::now();
        let mut output = Vec::new();
        let mut status = SourceStatus::Open;
        while start.elapsed() < limit {
            status = source.drain(pty, &mut |bytes| output.extend_from_slice(bytes));
            if status == SourceStatus::Closed {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        (output, status)
    }

    #[test]
    fn test_inline_reads_until_end_of_stream() {
        let pty = spawn(ShellCommand::new("/bin/sh").arg("-c").arg("echo inline-output"));
        let mut source = OutputSource::inline(64);

        let (output, status) = collect(&mut source, &pty, Duration::from_secs(5));
        assert_eq!(status, SourceStatus::Closed);
        assert!(String::from_utf8_lossy(&output).contains("inline-output"));
    }

    #[test]
    fn test_inline_without_output_stays_open() {
        let pty = spawn(ShellCommand::new("sleep").arg("5"));
        let mut source = OutputSource::inline(64);
        let mut calls = 0;
        let status = source.drain(&pty, &mut |_| calls += 1);
        assert_eq!(status, SourceStatus::Open);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_background_reads_until_end_of_stream() {
        let pty = Arc::new(spawn(ShellCommand::new("/bin/sh").arg("-c").arg("echo background-output")));
        let running = Arc::new(AtomicBool::new(true));
        let mut source = OutputSource::background(
            pty.clone(),
            running.clone(),
            Duration::from_millis(10),
            4096,
        )
        .unwrap();

        let (output, status) = collect(&mut source, &pty, Duration::from_secs(5));
        assert_eq!(status, SourceStatus::Closed);
        assert!(String::from_utf8_lossy(&output).contains("background-output"));
        assert!(!running.load(Ordering::SeqCst));
        source.join();
    }

    #[test]
    fn test_background_stops_when_cancelled() {
        let pty = Arc::new(spawn(ShellCommand::new("sleep").arg("30")));
        let running = Arc::new(AtomicBool::new(true));
        let mut source = OutputSource::background(
            pty.clone(),
            running.clone(),
            Duration::from_millis(10),
            4096,
        )
        .unwrap();

        running.store(false, Ordering::SeqCst);
        let start = Instant::now();
        source.join();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(source.drain(&pty, &mut |_| {}), SourceStatus::Closed);

        pty.terminate().unwrap();
    }
}
