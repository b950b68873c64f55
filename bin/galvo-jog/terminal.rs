//! Raw-mode keyboard input for POSIX terminals.

use galvo_scan::jog::{Key, KeySource, Prompt, decode_keys};
use galvo_scan::GalvoError;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use termios::{ECHO, ICANON, TCSANOW, Termios, VMIN, VTIME, tcsetattr};

fn io_error(context: &str) -> impl FnOnce(io::Error) -> GalvoError + '_ {
    move |source| GalvoError::Io {
        source,
        context: context.to_string(),
    }
}

/// Whether stdin is attached to a terminal
pub fn stdin_is_tty() -> bool {
    // SAFETY: isatty only inspects the descriptor
    unsafe { libc::isatty(io::stdin().as_raw_fd()) == 1 }
}

/// Terminal switched to unbuffered, non-echoing input for the lifetime of the value
///
/// Questions asked through [`Prompt::ask`] temporarily return to line mode so
/// names and numbers can be typed and edited normally.
pub struct RawTerminal {
    fd: i32,
    cooked: Termios,
    raw: Termios,
    pending: VecDeque<Key>,
}

impl RawTerminal {
    pub fn new() -> Result<Self, GalvoError> {
        let fd = io::stdin().as_raw_fd();
        let cooked = Termios::from_fd(fd).map_err(io_error("Failed to read terminal settings"))?;

        let mut raw = cooked;
        raw.c_lflag &= !(ICANON | ECHO);
        raw.c_cc[VMIN] = 1;
        raw.c_cc[VTIME] = 0;
        tcsetattr(fd, TCSANOW, &raw).map_err(io_error("Failed to enter raw mode"))?;

        Ok(Self {
            fd,
            cooked,
            raw,
            pending: VecDeque::new(),
        })
    }

    fn set(&self, mode: &Termios) -> Result<(), GalvoError> {
        tcsetattr(self.fd, TCSANOW, mode).map_err(io_error("Failed to change terminal mode"))
    }
}

impl KeySource for RawTerminal {
    fn next_key(&mut self) -> Result<Option<Key>, GalvoError> {
        let mut buf = [0u8; 16];
        while self.pending.is_empty() {
            let n = io::stdin().read(&mut buf).map_err(io_error("Failed to read key"))?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend(decode_keys(&buf[..n]));
        }
        Ok(self.pending.pop_front())
    }
}

impl Prompt for RawTerminal {
    fn ask(&mut self, question: &str) -> Result<String, GalvoError> {
        self.say(question);
        self.set(&self.cooked)?;
        let mut line = String::new();
        let read = io::stdin()
            .read_line(&mut line)
            .map_err(io_error("Failed to read answer"));
        self.set(&self.raw)?;
        read?;
        Ok(line.trim().to_string())
    }

    fn say(&mut self, message: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{message}");
        let _ = stdout.flush();
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = tcsetattr(self.fd, TCSANOW, &self.cooked);
    }
}
