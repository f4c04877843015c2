//! Local terminal helpers for the connecting side.

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size as terminal_size};
use std::io::IsTerminal;
use tracing::warn;

/// Puts the local terminal into raw mode for the lifetime of the guard and
/// restores it on drop, including on the error paths out of the session loop.
pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new() -> Self {
        match enable_raw_mode() {
            Ok(()) => Self(true),
            Err(err) => {
                warn!(error = %err, "failed to enable raw mode");
                Self(false)
            }
        }
    }
}

impl Default for RawModeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

/// Current local terminal size as `(cols, rows)`, with environment and
/// hardcoded fallbacks for odd environments.
pub fn detect_terminal_size() -> (u16, u16) {
    if let Ok((cols, rows)) = terminal_size() {
        if cols > 0 && rows > 0 {
            return (cols, rows);
        }
    }

    let cols = std::env::var("COLUMNS")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(80);
    let rows = std::env::var("LINES")
        .or_else(|_| std::env::var("ROWS"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(24);
    (cols.max(1), rows.max(1))
}
