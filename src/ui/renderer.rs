//! Terminal renderer using crossterm
//!
//! Presents the backend's screen on the host terminal and reads host input.
//! While a bell pulse is active every color is blended toward white.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{
        self, Event, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
        PushKeyboardEnhancementFlags,
    },
    execute, queue,
    style::{Attribute, Color, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use tracing::{debug, warn};
use vt100::Color as VtColor;

use super::keymapper::KeyEvent;
use super::signals;
use super::surface::{Surface, SurfaceEvent};
use crate::core::backend::Vt100Backend;
use crate::core::bell::BELL_MAX_INTENSITY;

/// Strongest overlay, out of 255
const BELL_MAX_ALPHA: u32 = 100;

/// Colors assumed for the host's default foreground and background
const DEFAULT_FG: (u8, u8, u8) = (229, 229, 229);
const DEFAULT_BG: (u8, u8, u8) = (0, 0, 0);

/// Style of a run of cells
#[derive(Clone, Copy, PartialEq, Eq)]
struct CellStyle {
    fg: Color,
    bg: Color,
    bold: bool,
    italic: bool,
    underline: bool,
    inverse: bool,
}

impl Default for CellStyle {
    fn default() -> Self {
        Self {
            fg: Color::Reset,
            bg: Color::Reset,
            bold: false,
            italic: false,
            underline: false,
            inverse: false,
        }
    }
}

impl CellStyle {
    fn from_cell(cell: &vt100::Cell, alpha: u8) -> Self {
        Self {
            fg: overlay(map_color(cell.fgcolor()), DEFAULT_FG, alpha),
            bg: overlay(map_color(cell.bgcolor()), DEFAULT_BG, alpha),
            bold: cell.bold(),
            italic: cell.italic(),
            underline: cell.underline(),
            inverse: cell.inverse(),
        }
    }

    /// Style of cells outside the screen, under the same overlay
    fn blank(alpha: u8) -> Self {
        Self {
            fg: overlay(Color::Reset, DEFAULT_FG, alpha),
            bg: overlay(Color::Reset, DEFAULT_BG, alpha),
            ..Self::default()
        }
    }
}

/// Terminal renderer
pub struct Renderer {
    /// Whether the terminal has been initialized
    initialized: bool,
    keyboard_enhanced: bool,
    /// Forward host resizes to the relay
    follow_host_size: bool,
    /// Backend generation and bell intensity of the last frame
    last_frame: Option<(u64, u16)>,
}

impl Renderer {
    pub fn new(follow_host_size: bool) -> Self {
        Self {
            initialized: false,
            keyboard_enhanced: false,
            follow_host_size,
            last_frame: None,
        }
    }

    /// Initialize the terminal for rendering
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        self.initialized = true;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;

        // Caps Lock and keypad state are only reported with the kitty protocol
        if terminal::supports_keyboard_enhancement().unwrap_or(false) {
            execute!(
                stdout,
                PushKeyboardEnhancementFlags(
                    KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                        | KeyboardEnhancementFlags::REPORT_ALL_KEYS_AS_ESCAPE_CODES
                )
            )?;
            self.keyboard_enhanced = true;
        }
        debug!("Renderer ready (keyboard enhancement: {})", self.keyboard_enhanced);

        stdout.flush()
    }

    /// Cleanup the terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        if self.keyboard_enhanced {
            let _ = execute!(stdout, PopKeyboardEnhancementFlags);
            self.keyboard_enhanced = false;
        }
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();

        terminal::disable_raw_mode()
    }

    /// Render the screen with the bell overlay
    pub fn render(&mut self, screen: &vt100::Screen, bell_intensity: u16) -> io::Result<()> {
        let stdout = io::stdout();
        let mut stdout = io::BufWriter::with_capacity(65536, stdout.lock());
        draw(&mut stdout, screen, bell_intensity)?;
        stdout.flush()
    }

    /// Get terminal size
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }

    /// Translate one host event into what the relay cares about
    fn host_event(&mut self, event: Event) -> Option<SurfaceEvent> {
        match event {
            Event::Key(key) => KeyEvent::from_crossterm(&key).map(SurfaceEvent::Key),
            Event::Resize(cols, rows) => {
                // Any host resize repaints in full, even with a fixed grid
                self.last_frame = None;
                self.follow_host_size.then_some(SurfaceEvent::Resized { cols, rows })
            }
            _ => None,
        }
    }
}

impl Surface<Vt100Backend> for Renderer {
    fn poll_event(&mut self, timeout: Duration) -> io::Result<Option<SurfaceEvent>> {
        if signals::take_close_request() {
            return Ok(Some(SurfaceEvent::CloseRequested));
        }
        if !event::poll(timeout)? {
            return Ok(None);
        }

        let host_event = event::read()?;
        Ok(self.host_event(host_event))
    }

    fn present(&mut self, backend: &Vt100Backend, bell_intensity: u16) -> io::Result<()> {
        let frame = (backend.generation(), bell_intensity);
        if self.last_frame == Some(frame) {
            return Ok(());
        }
        self.render(backend.screen(), bell_intensity)?;
        self.last_frame = Some(frame);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Write one full frame for `screen`
fn draw<W: Write>(out: &mut W, screen: &vt100::Screen, bell_intensity: u16) -> io::Result<()> {
    let (rows, cols) = screen.size();
    let alpha = overlay_alpha(bell_intensity);

    // Begin synchronized update (reduces flicker)
    write!(out, "\x1b[?2026h")?;
    queue!(out, Hide)?;

    let mut line_buffer = String::with_capacity(256);
    for row in 0..rows {
        queue!(out, MoveTo(0, row))?;
        line_buffer.clear();
        let mut current = CellStyle::default();

        for col in 0..cols {
            let Some(cell) = screen.cell(row, col) else {
                continue;
            };
            // Wide character continuations are skipped
            if cell.is_wide_continuation() {
                continue;
            }

            let style = CellStyle::from_cell(cell, alpha);
            if style != current && !line_buffer.is_empty() {
                apply_style(out, &current)?;
                write!(out, "{}", line_buffer)?;
                line_buffer.clear();
            }
            current = style;

            if cell.has_contents() {
                line_buffer.push_str(&cell.contents());
            } else {
                line_buffer.push(' ');
            }
        }

        if !line_buffer.is_empty() {
            apply_style(out, &current)?;
            write!(out, "{}", line_buffer)?;
        }

        // Anything right of the grid takes the blank style
        apply_style(out, &CellStyle::blank(alpha))?;
        write!(out, "\x1b[K")?;
    }

    // Rows below the grid
    queue!(out, MoveTo(0, rows))?;
    apply_style(out, &CellStyle::blank(alpha))?;
    queue!(out, Clear(ClearType::FromCursorDown))?;
    queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;

    if !screen.hide_cursor() {
        let (cursor_row, cursor_col) = screen.cursor_position();
        queue!(out, MoveTo(cursor_col, cursor_row), Show)?;
    }

    // End synchronized update
    write!(out, "\x1b[?2026l")
}

/// Apply cell attributes
fn apply_style<W: Write>(out: &mut W, style: &CellStyle) -> io::Result<()> {
    // Reset first
    queue!(out, SetAttribute(Attribute::Reset))?;

    if style.bold {
        queue!(out, SetAttribute(Attribute::Bold))?;
    }
    if style.italic {
        queue!(out, SetAttribute(Attribute::Italic))?;
    }
    if style.underline {
        queue!(out, SetAttribute(Attribute::Underlined))?;
    }
    if style.inverse {
        queue!(out, SetAttribute(Attribute::Reverse))?;
    }

    queue!(out, SetForegroundColor(style.fg), SetBackgroundColor(style.bg))
}

fn map_color(color: VtColor) -> Color {
    match color {
        VtColor::Default => Color::Reset,
        VtColor::Idx(idx) => Color::AnsiValue(idx),
        VtColor::Rgb(r, g, b) => Color::Rgb { r, g, b },
    }
}

/// Bell intensity as an overlay alpha in `0..=BELL_MAX_ALPHA` (of 255)
fn overlay_alpha(intensity: u16) -> u8 {
    let intensity = u32::from(intensity.min(BELL_MAX_INTENSITY));
    (intensity * BELL_MAX_ALPHA / u32::from(BELL_MAX_INTENSITY)) as u8
}

/// Blend `color` toward white by `alpha`/255
fn overlay(color: Color, default: (u8, u8, u8), alpha: u8) -> Color {
    if alpha == 0 {
        return color;
    }
    let (r, g, b) = match color {
        Color::Rgb { r, g, b } => (r, g, b),
        Color::AnsiValue(idx) => xterm_rgb(idx),
        _ => default,
    };
    let mix = |c: u8| -> u8 {
        let c = u32::from(c);
        let a = u32::from(alpha);
        ((c * (255 - a) + 255 * a) / 255) as u8
    };
    Color::Rgb {
        r: mix(r),
        g: mix(g),
        b: mix(b),
    }
}

/// RGB value of an xterm 256-color palette index
fn xterm_rgb(idx: u8) -> (u8, u8, u8) {
    const BASE: [(u8, u8, u8); 16] = [
        (0, 0, 0),
        (205, 0, 0),
        (0, 205, 0),
        (205, 205, 0),
        (0, 0, 238),
        (205, 0, 205),
        (0, 205, 205),
        (229, 229, 229),
        (127, 127, 127),
        (255, 0, 0),
        (0, 255, 0),
        (255, 255, 0),
        (92, 92, 255),
        (255, 0, 255),
        (0, 255, 255),
        (255, 255, 255),
    ];
    const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

    match idx {
        0..=15 => BASE[idx as usize],
        16..=231 => {
            let i = idx - 16;
            (
                LEVELS[(i / 36) as usize],
                LEVELS[((i / 6) % 6) as usize],
                LEVELS[(i % 6) as usize],
            )
        }
        _ => {
            let level = 8 + 10 * (idx - 232);
            (level, level, level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen_with(bytes: &[u8]) -> vt100::Parser {
        let mut parser = vt100::Parser::new(3, 10, 0);
        parser.process(bytes);
        parser
    }

    fn frame(parser: &vt100::Parser, intensity: u16) -> String {
        let mut out = Vec::new();
        draw(&mut out, parser.screen(), intensity).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_overlay_alpha_range() {
        assert_eq!(overlay_alpha(0), 0);
        assert_eq!(overlay_alpha(500), 50);
        assert_eq!(overlay_alpha(BELL_MAX_INTENSITY), 100);
        assert_eq!(overlay_alpha(u16::MAX), 100);
    }

    #[test]
    fn test_overlay_blends_toward_white() {
        assert_eq!(overlay(Color::Red, DEFAULT_FG, 0), Color::Red);
        assert_eq!(
            overlay(Color::Rgb { r: 0, g: 0, b: 0 }, DEFAULT_BG, 255),
            Color::Rgb { r: 255, g: 255, b: 255 }
        );
        match overlay(Color::Reset, DEFAULT_BG, 100) {
            Color::Rgb { r, g, b } => {
                assert!(r > 0 && r < 255);
                assert_eq!((r, g, b), (r, r, r));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_xterm_palette() {
        assert_eq!(xterm_rgb(1), (205, 0, 0));
        assert_eq!(xterm_rgb(16), (0, 0, 0));
        assert_eq!(xterm_rgb(196), (255, 0, 0));
        assert_eq!(xterm_rgb(231), (255, 255, 255));
        assert_eq!(xterm_rgb(232), (8, 8, 8));
        assert_eq!(xterm_rgb(255), (238, 238, 238));
    }

    #[test]
    fn test_draw_contains_text_and_sync_markers() {
        let parser = screen_with(b"hello\r\n\x1b[31mred");
        let output = frame(&parser, 0);
        assert!(output.starts_with("\x1b[?2026h"));
        assert!(output.ends_with("\x1b[?2026l"));
        assert!(output.contains("hello"));
        assert!(output.contains("red"));
    }

    #[test]
    fn test_host_resize_forces_full_redraw() {
        let mut fixed = Renderer::new(false);
        fixed.last_frame = Some((1, 0));
        assert_eq!(fixed.host_event(Event::Resize(100, 40)), None);
        assert_eq!(fixed.last_frame, None);

        let mut following = Renderer::new(true);
        following.last_frame = Some((1, 0));
        assert_eq!(
            following.host_event(Event::Resize(100, 40)),
            Some(SurfaceEvent::Resized { cols: 100, rows: 40 })
        );
        assert_eq!(following.last_frame, None);
    }

    #[test]
    fn test_draw_with_bell_uses_rgb() {
        let parser = screen_with(b"x");
        let quiet = frame(&parser, 0);
        let flashing = frame(&parser, BELL_MAX_INTENSITY);
        assert_ne!(quiet, flashing);
        // Truecolor SGR only appears under the overlay
        assert!(!quiet.contains("38;2;"));
        assert!(flashing.contains("38;2;"));
    }
}
