use std::fmt;

/// A key press understood by the jog loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Left,
    Right,
    Up,
    Down,
    Plus,
    Minus,
    Digit(u8),
    /// A letter command such as `s` or `v`
    Char(char),
    Esc,
    Enter,
}

impl Key {
    /// Parse a key name as typed on a line console: `left`, `+`, `7`, `esc`, `s`...
    pub fn from_name(name: &str) -> Option<Key> {
        let name = name.trim();
        match name.to_ascii_lowercase().as_str() {
            "left" => return Some(Key::Left),
            "right" => return Some(Key::Right),
            "up" => return Some(Key::Up),
            "down" => return Some(Key::Down),
            "esc" | "escape" => return Some(Key::Esc),
            "" | "enter" | "return" => return Some(Key::Enter),
            _ => {}
        }

        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Key::from_char(c),
            _ => None,
        }
    }

    fn from_char(c: char) -> Option<Key> {
        match c {
            '+' | '=' => Some(Key::Plus),
            '-' | '_' => Some(Key::Minus),
            '0'..='9' => Some(Key::Digit(c as u8 - b'0')),
            '\r' | '\n' => Some(Key::Enter),
            c if c.is_ascii_alphabetic() => Some(Key::Char(c.to_ascii_lowercase())),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Left => write!(f, "left"),
            Key::Right => write!(f, "right"),
            Key::Up => write!(f, "up"),
            Key::Down => write!(f, "down"),
            Key::Plus => write!(f, "+"),
            Key::Minus => write!(f, "-"),
            Key::Digit(d) => write!(f, "{d}"),
            Key::Char(c) => write!(f, "{c}"),
            Key::Esc => write!(f, "esc"),
            Key::Enter => write!(f, "enter"),
        }
    }
}

/// Decode bytes read from a terminal in raw mode
///
/// Arrow keys arrive as `ESC [ A..D` (or `ESC O A..D` in application
/// mode). An ESC that does not start such a sequence is the escape key.
/// Bytes that map to no key are dropped.
pub fn decode_keys(bytes: &[u8]) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            0x1b => match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(b'[' | b'O'), Some(code @ b'A'..=b'D')) => {
                    keys.push(match code {
                        b'A' => Key::Up,
                        b'B' => Key::Down,
                        b'C' => Key::Right,
                        _ => Key::Left,
                    });
                    i += 3;
                }
                _ => {
                    keys.push(Key::Esc);
                    i += 1;
                }
            },
            byte => {
                if let Some(key) = Key::from_char(byte as char) {
                    keys.push(key);
                }
                i += 1;
            }
        }
    }
    keys
}
