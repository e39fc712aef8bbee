//! Terminal backend
//!
//! The backend interprets the shell's byte stream and keeps the screen
//! state the renderer draws from. The relay only needs three calls from it
//! (`feed`, `resize`, `shutdown`) plus a way to hear about notable events
//! such as the bell.

use tracing::debug;

/// Keyboard LED request (DECLL)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    ClearAll,
    ScrollLock,
    NumLock,
    CapsLock,
}

impl LedState {
    pub fn from_param(param: u32) -> Option<Self> {
        match param {
            0 => Some(LedState::ClearAll),
            1 => Some(LedState::ScrollLock),
            2 => Some(LedState::NumLock),
            3 => Some(LedState::CapsLock),
            _ => None,
        }
    }
}

/// Which family of mode sequence changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    /// `CSI ? Pn h/l`
    Dec,
    /// `CSI Pn h/l`
    Ansi,
    /// Linux console private sequences
    Linux,
}

/// Notification raised by the backend while interpreting output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Bell,
    /// Device status report requested (`CSI 5 n`)
    DeviceStatus,
    /// Device attributes requested (`CSI c`)
    PrivateId,
    /// Cursor position report requested; 0-based cell coordinates
    CursorPositionReport { x: u16, y: u16 },
    KeyboardLeds(LedState),
    ModeChange {
        kind: ModeKind,
        values: Vec<u32>,
        final_byte: u8,
    },
}

/// Consumer-facing side of an escape-sequence interpreter
pub trait TerminalBackend {
    /// Interpret output bytes, reporting notifications through `notify`
    fn feed(&mut self, bytes: &[u8], notify: &mut dyn FnMut(TerminalEvent));

    /// Change the grid size
    fn resize(&mut self, cols: u16, rows: u16);

    /// Release backend resources; no further calls follow
    fn shutdown(&mut self);
}

/// What the query scanner found at the end of a control sequence
#[derive(Debug, Clone, PartialEq, Eq)]
enum Detected {
    Event(TerminalEvent),
    /// `CSI 6 n`; answered with the cursor position at this point in the stream
    CursorQuery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Ground,
    Escape,
    Csi,
}

/// Picks the control sequences the relay cares about out of the byte stream
///
/// Only CSI sequences are tracked. Sequences may be split across chunks.
#[derive(Debug)]
struct QueryScanner {
    state: ScanState,
    private: Option<u8>,
    intermediate: bool,
    params: Vec<u32>,
    current: Option<u32>,
}

impl QueryScanner {
    fn new() -> Self {
        Self {
            state: ScanState::Ground,
            private: None,
            intermediate: false,
            params: Vec::new(),
            current: None,
        }
    }

    fn advance(&mut self, byte: u8) -> Option<Detected> {
        match self.state {
            ScanState::Ground => {
                if byte == 0x1b {
                    self.state = ScanState::Escape;
                }
                None
            }
            ScanState::Escape => {
                if byte == b'[' {
                    self.private = None;
                    self.intermediate = false;
                    self.params.clear();
                    self.current = None;
                    self.state = ScanState::Csi;
                } else if byte != 0x1b {
                    self.state = ScanState::Ground;
                }
                None
            }
            ScanState::Csi => self.advance_csi(byte),
        }
    }

    fn advance_csi(&mut self, byte: u8) -> Option<Detected> {
        match byte {
            b'0'..=b'9' => {
                let digit = u32::from(byte - b'0');
                let value = self.current.unwrap_or(0);
                self.current = Some(value.saturating_mul(10).saturating_add(digit));
                None
            }
            b';' => {
                self.params.push(self.current.take().unwrap_or(0));
                None
            }
            b'<'..=b'?' => {
                if self.params.is_empty() && self.current.is_none() {
                    self.private = Some(byte);
                } else {
                    self.intermediate = true;
                }
                None
            }
            0x20..=0x2f | b':' => {
                self.intermediate = true;
                None
            }
            0x40..=0x7e => {
                self.state = ScanState::Ground;
                if let Some(value) = self.current.take() {
                    self.params.push(value);
                }
                if self.intermediate {
                    return None;
                }
                self.dispatch(byte)
            }
            0x1b => {
                self.state = ScanState::Escape;
                None
            }
            // CAN / SUB abort the sequence
            0x18 | 0x1a => {
                self.state = ScanState::Ground;
                None
            }
            // Other C0 controls execute without ending the sequence
            _ => None,
        }
    }

    fn dispatch(&self, final_byte: u8) -> Option<Detected> {
        let params = &self.params;
        let first = params.first().copied().unwrap_or(0);
        match (self.private, final_byte) {
            (None, b'n') if first == 5 => Some(Detected::Event(TerminalEvent::DeviceStatus)),
            (None, b'n') if first == 6 => Some(Detected::CursorQuery),
            (None, b'c') if first == 0 => Some(Detected::Event(TerminalEvent::PrivateId)),
            (None, b'q') => LedState::from_param(first)
                .map(|state| Detected::Event(TerminalEvent::KeyboardLeds(state))),
            (None, b'h') | (None, b'l') | (Some(b'?'), b'h') | (Some(b'?'), b'l') => {
                let kind = if self.private.is_some() {
                    ModeKind::Dec
                } else {
                    ModeKind::Ansi
                };
                Some(Detected::Event(TerminalEvent::ModeChange {
                    kind,
                    values: params.clone(),
                    final_byte,
                }))
            }
            (None, b']') => Some(Detected::Event(TerminalEvent::ModeChange {
                kind: ModeKind::Linux,
                values: params.clone(),
                final_byte,
            })),
            _ => None,
        }
    }
}

/// Backend built on the `vt100` parser
pub struct Vt100Backend {
    parser: vt100::Parser,
    scanner: QueryScanner,
    bells_seen: usize,
    /// Bumped on every change the renderer should pick up
    generation: u64,
    shut_down: bool,
}

impl Vt100Backend {
    /// Create a backend for a `cols` x `rows` grid
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Result<Self, String> {
        if cols == 0 || rows == 0 {
            return Err(format!("invalid grid size {}x{}", cols, rows));
        }
        Ok(Self {
            parser: vt100::Parser::new(rows, cols, scrollback),
            scanner: QueryScanner::new(),
            bells_seen: 0,
            generation: 0,
            shut_down: false,
        })
    }

    pub fn screen(&self) -> &vt100::Screen {
        self.parser.screen()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl TerminalBackend for Vt100Backend {
    fn feed(&mut self, bytes: &[u8], notify: &mut dyn FnMut(TerminalEvent)) {
        if self.shut_down || bytes.is_empty() {
            return;
        }

        // Process up to each detected sequence so cursor reports see the
        // screen exactly as it was when the query arrived.
        let mut start = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            let Some(found) = self.scanner.advance(byte) else {
                continue;
            };
            self.parser.process(&bytes[start..=i]);
            start = i + 1;

            let event = match found {
                Detected::Event(event) => event,
                Detected::CursorQuery => {
                    let (row, col) = self.parser.screen().cursor_position();
                    TerminalEvent::CursorPositionReport { x: col, y: row }
                }
            };
            notify(event);
        }
        self.parser.process(&bytes[start..]);
        self.generation = self.generation.wrapping_add(1);

        // Several bells in one chunk still produce a single pulse restart
        let bells = self.parser.screen().audible_bell_count();
        if bells != self.bells_seen {
            self.bells_seen = bells;
            notify(TerminalEvent::Bell);
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
        self.generation = self.generation.wrapping_add(1);
        debug!("Backend resized to {}x{}", cols, rows);
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}
