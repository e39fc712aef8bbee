//! Key mapping for terminal input
//!
//! Converts key presses to the byte sequences written to the PTY.
//!
//! Printable keys carry four variants (regular, shift, caps, shift+caps)
//! resolved by a fixed precedence:
//!
//! 1. Caps Lock and Shift → shift+caps variant
//! 2. Caps Lock → caps variant
//! 3. Shift → shift variant
//! 4. Ctrl on a letter → control byte (`'A' - 0x40`, i.e. 1..=26)
//! 5. otherwise → regular variant
//!
//! Editing, navigation and function keys emit one fixed sequence no matter
//! which modifiers are held. Keys without a mapping produce no bytes.

use bitflags::bitflags;
use crossterm::event::{
    KeyCode, KeyEvent as CtKeyEvent, KeyEventKind, KeyEventState, KeyModifiers,
};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Modifiers: u8 {
        const SHIFT     = 0b0001;
        const CTRL      = 0b0010;
        const ALT       = 0b0100;
        const CAPS_LOCK = 0b1000;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// Logical key identity, independent of the modifiers held
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// `b'a'..=b'z'`
    Letter(u8),
    /// `0..=9` on the main row
    Digit(u8),
    Backquote,
    Minus,
    Equals,
    LeftBracket,
    RightBracket,
    Backslash,
    Semicolon,
    Quote,
    Comma,
    Period,
    Slash,
    Space,
    Tab,
    Backspace,
    Return,
    Escape,
    Up,
    Down,
    Left,
    Right,
    Insert,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    /// F1..F12 are mapped; anything above is not
    F(u8),
    KpDivide,
    KpMultiply,
    KpMinus,
    KpPlus,
    KpEnter,
    KpPeriod,
    /// Keypad `0..=9`
    KpDigit(u8),
    CapsLock,
    NumLock,
    ScrollLock,
    PrintScreen,
    Pause,
    Menu,
    /// A modifier key pressed on its own
    Modifier,
    Media,
}

const SHIFTED_DIGITS: &[u8; 10] = b")!@#$%^&*(";

impl Key {
    /// Identify the key that types `ch` on a US layout
    ///
    /// The flag is true when `ch` is the shifted character of that key.
    pub fn from_char(ch: char) -> Option<(Key, bool)> {
        if !ch.is_ascii() {
            return None;
        }
        let byte = ch as u8;
        let found = match byte {
            b'a'..=b'z' => (Key::Letter(byte), false),
            b'A'..=b'Z' => (Key::Letter(byte.to_ascii_lowercase()), true),
            b'0'..=b'9' => (Key::Digit(byte - b'0'), false),
            b' ' => (Key::Space, false),
            _ => {
                if let Some(pos) = SHIFTED_DIGITS.iter().position(|&c| c == byte) {
                    return Some((Key::Digit(pos as u8), true));
                }
                return SYMBOL_KEYS.iter().find_map(|&(key, regular, shift)| {
                    if byte == regular {
                        Some((key, false))
                    } else if byte == shift {
                        Some((key, true))
                    } else {
                        None
                    }
                });
            }
        };
        Some(found)
    }

    /// Keypad key that produced `ch` when the host flags a keypad event
    fn keypad_from_char(ch: char) -> Option<Key> {
        match ch {
            '0'..='9' => Some(Key::KpDigit(ch as u8 - b'0')),
            '/' => Some(Key::KpDivide),
            '*' => Some(Key::KpMultiply),
            '-' => Some(Key::KpMinus),
            '+' => Some(Key::KpPlus),
            '.' => Some(Key::KpPeriod),
            _ => None,
        }
    }

    fn is_letter(&self) -> bool {
        matches!(self, Key::Letter(_))
    }
}

/// Symbol keys with their unshifted and shifted characters
const SYMBOL_KEYS: &[(Key, u8, u8)] = &[
    (Key::Backquote, b'`', b'~'),
    (Key::Minus, b'-', b'_'),
    (Key::Equals, b'=', b'+'),
    (Key::LeftBracket, b'[', b'{'),
    (Key::RightBracket, b']', b'}'),
    (Key::Backslash, b'\\', b'|'),
    (Key::Semicolon, b';', b':'),
    (Key::Quote, b'\'', b'"'),
    (Key::Comma, b',', b'<'),
    (Key::Period, b'.', b'>'),
    (Key::Slash, b'/', b'?'),
];

/// A key press as seen by the encoder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(key: Key, modifiers: Modifiers) -> Self {
        Self { key, modifiers }
    }

    /// Convert a crossterm key event; releases and unknown keys give `None`
    pub fn from_crossterm(event: &CtKeyEvent) -> Option<Self> {
        if !matches!(event.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
            return None;
        }

        let mut modifiers = Modifiers::from(event.modifiers);
        if event.state.contains(KeyEventState::CAPS_LOCK) {
            modifiers |= Modifiers::CAPS_LOCK;
        }
        let keypad = event.state.contains(KeyEventState::KEYPAD);

        let key = match event.code {
            KeyCode::Char(ch) => {
                if let Some(key) = keypad.then(|| Key::keypad_from_char(ch)).flatten() {
                    key
                } else {
                    let (key, shifted) = Key::from_char(ch)?;
                    // With Caps Lock reported, the case of a letter says nothing
                    // about Shift; otherwise a shifted character implies it.
                    let caps_letter = key.is_letter() && modifiers.contains(Modifiers::CAPS_LOCK);
                    if shifted && !caps_letter {
                        modifiers |= Modifiers::SHIFT;
                    }
                    key
                }
            }
            KeyCode::Enter if keypad => Key::KpEnter,
            KeyCode::Enter => Key::Return,
            KeyCode::Tab => Key::Tab,
            KeyCode::BackTab => {
                modifiers |= Modifiers::SHIFT;
                Key::Tab
            }
            KeyCode::Backspace => Key::Backspace,
            KeyCode::Esc => Key::Escape,
            KeyCode::Up => Key::Up,
            KeyCode::Down => Key::Down,
            KeyCode::Left => Key::Left,
            KeyCode::Right => Key::Right,
            KeyCode::Home => Key::Home,
            KeyCode::End => Key::End,
            KeyCode::PageUp => Key::PageUp,
            KeyCode::PageDown => Key::PageDown,
            KeyCode::Insert => Key::Insert,
            KeyCode::Delete => Key::Delete,
            KeyCode::F(n) => Key::F(n),
            KeyCode::KeypadBegin => Key::KpDigit(5),
            KeyCode::CapsLock => Key::CapsLock,
            KeyCode::NumLock => Key::NumLock,
            KeyCode::ScrollLock => Key::ScrollLock,
            KeyCode::PrintScreen => Key::PrintScreen,
            KeyCode::Pause => Key::Pause,
            KeyCode::Menu => Key::Menu,
            KeyCode::Modifier(_) => Key::Modifier,
            KeyCode::Media(_) => Key::Media,
            KeyCode::Null => return None,
        };

        Some(Self::new(key, modifiers))
    }
}

/// The four modifier variants of a printable key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyVariants {
    pub regular: u8,
    pub shift: u8,
    pub caps: u8,
    pub shift_caps: u8,
}

impl KeyVariants {
    /// Caps Lock inverts Shift
    const fn letter(lower: u8) -> Self {
        let upper = lower.to_ascii_uppercase();
        Self {
            regular: lower,
            shift: upper,
            caps: upper,
            shift_caps: lower,
        }
    }

    /// Caps Lock has no effect; Shift alone decides
    const fn symbol(regular: u8, shift: u8) -> Self {
        Self {
            regular,
            shift,
            caps: regular,
            shift_caps: shift,
        }
    }

    /// Pick the output byte by modifier precedence
    pub fn resolve(&self, mods: Modifiers) -> u8 {
        let caps = mods.contains(Modifiers::CAPS_LOCK);
        let shift = mods.contains(Modifiers::SHIFT);

        if caps && shift {
            self.shift_caps
        } else if caps {
            self.caps
        } else if shift {
            self.shift
        } else if mods.contains(Modifiers::CTRL) && self.shift.is_ascii_alphabetic() {
            self.shift - 0x40
        } else {
            self.regular
        }
    }
}

/// How a key is encoded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyMapping {
    Variants(KeyVariants),
    /// Emitted verbatim, modifiers ignored
    Fixed(&'static [u8]),
}

const UP_ESC: &[u8] = b"\x1bOA";
const DOWN_ESC: &[u8] = b"\x1bOB";
const RIGHT_ESC: &[u8] = b"\x1bOC";
const LEFT_ESC: &[u8] = b"\x1bOD";
const INSERT_ESC: &[u8] = b"\x1b[2~";
const DELETE_ESC: &[u8] = b"\x1b[3~";
const HOME_ESC: &[u8] = b"\x1b[H";
const END_ESC: &[u8] = b"\x1b[F";
const PAGEUP_ESC: &[u8] = b"\x1b[5~";
const PAGEDOWN_ESC: &[u8] = b"\x1b[6~";

const FUNCTION_KEYS: [&[u8]; 12] = [
    b"\x1bOP",
    b"\x1bOQ",
    b"\x1bOR",
    b"\x1bOS",
    b"\x1b[15~",
    b"\x1b[17~",
    b"\x1b[18~",
    b"\x1b[19~",
    b"\x1b[20~",
    b"\x1b[21~",
    b"\x1b[23~",
    b"\x1b[24~",
];

/// Look up the mapping for a key; `None` means the key is ignored
pub fn lookup(key: Key) -> Option<KeyMapping> {
    use KeyMapping::Fixed;

    let mapping = match key {
        Key::Letter(c) if c.is_ascii_lowercase() => KeyMapping::Variants(KeyVariants::letter(c)),
        Key::Digit(d) if d <= 9 => {
            KeyMapping::Variants(KeyVariants::symbol(b'0' + d, SHIFTED_DIGITS[d as usize]))
        }
        Key::Backquote
        | Key::Minus
        | Key::Equals
        | Key::LeftBracket
        | Key::RightBracket
        | Key::Backslash
        | Key::Semicolon
        | Key::Quote
        | Key::Comma
        | Key::Period
        | Key::Slash => {
            let &(_, regular, shift) = SYMBOL_KEYS.iter().find(|(k, _, _)| *k == key)?;
            KeyMapping::Variants(KeyVariants::symbol(regular, shift))
        }

        Key::Space => Fixed(b" "),
        Key::Tab => Fixed(b"\t"),
        Key::Backspace => Fixed(b"\x08"),
        Key::Return => Fixed(b"\r"),
        Key::Escape => Fixed(b"\x1b"),

        Key::KpDivide => Fixed(b"/"),
        Key::KpMultiply => Fixed(b"*"),
        Key::KpMinus => Fixed(b"-"),
        Key::KpPlus => Fixed(b"+"),

        Key::Up | Key::KpDigit(8) => Fixed(UP_ESC),
        Key::Down | Key::KpDigit(2) => Fixed(DOWN_ESC),
        Key::Right | Key::KpDigit(6) => Fixed(RIGHT_ESC),
        Key::Left | Key::KpDigit(4) => Fixed(LEFT_ESC),
        Key::Insert | Key::KpDigit(0) => Fixed(INSERT_ESC),
        Key::Delete | Key::KpPeriod => Fixed(DELETE_ESC),
        Key::Home | Key::KpDigit(7) => Fixed(HOME_ESC),
        Key::End | Key::KpDigit(1) => Fixed(END_ESC),
        Key::PageUp | Key::KpDigit(9) => Fixed(PAGEUP_ESC),
        Key::PageDown | Key::KpDigit(3) => Fixed(PAGEDOWN_ESC),

        Key::F(n @ 1..=12) => Fixed(FUNCTION_KEYS[n as usize - 1]),

        _ => return None,
    };
    Some(mapping)
}

/// Key mapper for converting key events to bytes
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyMapper {
    /// Prefix ESC on printable keys while Alt is held
    pub alt_sends_escape: bool,
    /// Backspace sends DEL (0x7f) instead of BS (0x08)
    pub backspace_sends_delete: bool,
}

impl KeyMapper {
    pub fn new(alt_sends_escape: bool, backspace_sends_delete: bool) -> Self {
        Self {
            alt_sends_escape,
            backspace_sends_delete,
        }
    }

    /// Bytes for one key press; empty for unmapped keys
    pub fn encode(&self, key: Key, mods: Modifiers) -> Vec<u8> {
        if key == Key::Backspace && self.backspace_sends_delete {
            return vec![0x7f];
        }

        match lookup(key) {
            None => Vec::new(),
            Some(KeyMapping::Fixed(bytes)) => bytes.to_vec(),
            Some(KeyMapping::Variants(variants)) => {
                let byte = variants.resolve(mods);
                if self.alt_sends_escape && mods.contains(Modifiers::ALT) {
                    vec![0x1b, byte]
                } else {
                    vec![byte]
                }
            }
        }
    }

    pub fn encode_event(&self, event: &KeyEvent) -> Vec<u8> {
        self.encode(event.key, event.modifiers)
    }
}
