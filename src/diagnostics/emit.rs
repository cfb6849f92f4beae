//! Diagnostic emission backend.
//!
//! Lines are formatted into a fixed stack buffer and handed to `write(2)` in
//! one call. Nothing here allocates or locks.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};

use super::kind::{Diagnostic, HW101};
use crate::api::config::FatalAction;
use crate::api::error::HeapError;
use crate::api::stats::LeakReport;

/// Global flag to suppress non-fatal diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Longest report we ever emit; longer output is truncated.
const LINE_CAPACITY: usize = 512;

/// Suppress all non-fatal diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// A fixed-capacity text buffer that implements `fmt::Write`.
///
/// Writes past the capacity are dropped rather than reported as errors, so a
/// long detail string still produces a (truncated) line.
pub struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    /// Create an empty line.
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The line as text. Truncation may split a UTF-8 sequence; the partial
    /// tail is dropped.
    pub fn as_str(&self) -> &str {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                // SAFETY: `valid_up_to` marks the end of the valid prefix.
                unsafe { std::str::from_utf8_unchecked(&self.buf[..e.valid_up_to()]) }
            }
        }
    }

    /// Terminate the line with `\n`, overwriting the last byte if full.
    fn finish(&mut self) {
        if self.len == LINE_CAPACITY {
            self.buf[LINE_CAPACITY - 1] = b'\n';
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Write raw bytes to fd 2, retrying on `EINTR` and short writes.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length describe a live slice.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Format the standard diagnostic prefix, `[heapwarden][CODE] kind: `.
fn format_line(line: &mut LineBuffer, diag: &Diagnostic, detail: fmt::Arguments<'_>) {
    let _ = write!(line, "[heapwarden][{}] {}: ", diag.code, diag.kind.prefix());
    let _ = line.write_fmt(detail);
    line.finish();
}

/// The primary line followed by the note and help lines, if any.
fn format_report(line: &mut LineBuffer, diag: &Diagnostic, detail: fmt::Arguments<'_>) {
    format_line(line, diag, detail);
    if let Some(note) = diag.note {
        let _ = writeln!(line, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(line, "  help: {}", help);
    }
}

/// Emit the one-line leak summary.
///
/// Clean reports print nothing.
pub fn emit_leak_report(report: &LeakReport) {
    if report.is_clean() || is_suppressed() {
        return;
    }
    let mut line = LineBuffer::new();
    format_line(&mut line, &HW101, format_args!("{}", report));
    write_stderr(line.as_bytes());
}

/// Report an unrecoverable heap error and terminate the process.
///
/// The report (primary line, note, help) goes out in one write and is
/// printed even when diagnostics are suppressed. The process ends without
/// unwinding and without running `atexit` handlers.
pub fn fatal(err: &HeapError, action: FatalAction) -> ! {
    let mut line = LineBuffer::new();
    format_report(&mut line, err.diagnostic(), format_args!("{}", err));
    write_stderr(line.as_bytes());
    terminate(action)
}

/// End the process according to `action`.
pub fn terminate(action: FatalAction) -> ! {
    match action {
        // SAFETY: _exit and abort are async-signal-safe and never return.
        FatalAction::Exit(code) => unsafe { libc::_exit(code) },
        FatalAction::Abort => unsafe { libc::abort() },
    }
}

/// Emit a diagnostic using the log crate.
#[cfg(feature = "log")]
pub fn emit_to_log(diag: &Diagnostic, detail: fmt::Arguments<'_>) {
    use super::kind::DiagnosticKind;

    match diag.kind {
        DiagnosticKind::Error => log::error!("[{}] {}", diag.code, detail),
        DiagnosticKind::Warning => log::warn!("[{}] {}", diag.code, detail),
        DiagnosticKind::Note | DiagnosticKind::Help => log::info!("[{}] {}", diag.code, detail),
    }

    if let Some(note) = diag.note {
        log::info!("  note: {}", note);
    }
    if let Some(help) = diag.help {
        log::info!("  help: {}", help);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::kind::HW002;

    #[test]
    fn test_line_format() {
        let mut line = LineBuffer::new();
        format_line(&mut line, &HW002, format_args!("{}", HW002.message));
        assert_eq!(line.as_str(), "[heapwarden][HW002] error: double release detected\n");
    }

    #[test]
    fn test_leak_line_format() {
        let report = LeakReport {
            blocks: 1,
            bytes: 64,
            reclaimed: true,
        };
        let mut line = LineBuffer::new();
        format_line(&mut line, &HW101, format_args!("{}", report));
        assert_eq!(
            line.as_str(),
            "[heapwarden][HW101] warning: 1 blocks / 64 bytes leaked\n"
        );
    }

    #[test]
    fn test_fatal_report_carries_note_and_help() {
        let err = HeapError::DoubleRelease {
            block: 0x40,
            operation: crate::api::error::Operation::Release,
        };
        let mut line = LineBuffer::new();
        format_report(&mut line, err.diagnostic(), format_args!("{}", err));

        let text = line.as_str();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("[heapwarden][HW002] error: double release detected: release of block 0x40")
        );
        assert_eq!(lines.next(), Some("  note: the block's header says it was already released"));
        assert_eq!(
            lines.next(),
            Some("  help: check ownership of the pointer; only one owner may free it")
        );
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_line_truncates_without_error() {
        let mut line = LineBuffer::new();
        for _ in 0..100 {
            write!(line, "0123456789").unwrap();
        }
        line.finish();
        assert_eq!(line.as_bytes().len(), LINE_CAPACITY);
        assert_eq!(line.as_bytes()[LINE_CAPACITY - 1], b'\n');
    }

    #[test]
    fn test_suppression() {
        suppress_diagnostics(true);
        assert!(is_suppressed());
        suppress_diagnostics(false);
        assert!(!is_suppressed());
    }
}
