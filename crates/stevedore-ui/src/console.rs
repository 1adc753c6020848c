//! Terminal primitives.
//!
//! A thin layer over crossterm: colored and bold writes, line clearing
//! for the live progress region, and capability probes. Writes are
//! best-effort; a failing terminal never fails the task.

use std::io::{stdout, Write};
use std::sync::Mutex;

use crossterm::cursor::MoveUp;
use crossterm::style::{Color, Print, ResetColor, SetAttribute, SetForegroundColor, Attribute};
use crossterm::terminal::{Clear, ClearType};
use crossterm::tty::IsTty;
use crossterm::QueueableCommand;

/// Handle to the process's terminal.
pub struct Console {
    /// Colors and cursor movement are only used on a real terminal.
    interactive: bool,
    stdin_tty: bool,
    // Serializes writes so concurrent loggers cannot interleave output.
    lock: Mutex<()>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            interactive: stdout().is_tty(),
            stdin_tty: std::io::stdin().is_tty(),
            lock: Mutex::new(()),
        }
    }

    /// Whether the terminal supports cursor addressing and colors.
    pub fn supports_interactivity(&self) -> bool {
        self.interactive
    }

    pub fn stdin_is_tty(&self) -> bool {
        self.stdin_tty
    }

    /// Current terminal width, if it can be determined.
    pub fn width(&self) -> Option<u16> {
        if !self.interactive {
            return None;
        }
        crossterm::terminal::size().ok().map(|(columns, _)| columns)
    }

    pub fn println(&self, text: &str) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let mut out = stdout();
        let _ = out.queue(Print(text)).and_then(|o| o.queue(Print("\n")));
        let _ = out.flush();
    }

    pub fn print_colored(&self, color: Color, text: &str) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let mut out = stdout();
        if self.interactive {
            let _ = out
                .queue(SetForegroundColor(color))
                .and_then(|o| o.queue(Print(text)))
                .and_then(|o| o.queue(ResetColor))
                .and_then(|o| o.queue(Print("\n")));
        } else {
            let _ = out.queue(Print(text)).and_then(|o| o.queue(Print("\n")));
        }
        let _ = out.flush();
    }

    pub fn print_bold(&self, text: &str) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let mut out = stdout();
        if self.interactive {
            let _ = out
                .queue(SetAttribute(Attribute::Bold))
                .and_then(|o| o.queue(Print(text)))
                .and_then(|o| o.queue(SetAttribute(Attribute::Reset)))
                .and_then(|o| o.queue(Print("\n")));
        } else {
            let _ = out.queue(Print(text)).and_then(|o| o.queue(Print("\n")));
        }
        let _ = out.flush();
    }

    /// Erase the last `lines` lines written, leaving the cursor at the
    /// start of the erased region. Fancy mode only.
    pub fn clear_last_lines(&self, lines: u16) {
        if !self.interactive || lines == 0 {
            return;
        }
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let mut out = stdout();
        let _ = out
            .queue(MoveUp(lines))
            .and_then(|o| o.queue(Clear(ClearType::FromCursorDown)));
        let _ = out.flush();
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}
