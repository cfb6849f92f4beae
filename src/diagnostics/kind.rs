//! Diagnostic kinds and core types.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The process is about to be terminated.
    Error,
    /// Something is wrong but the process keeps its exit status.
    Warning,
    /// Additional context about another diagnostic.
    Note,
    /// Actionable suggestion to fix the issue.
    Help,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `HW0xx` - Fatal heap errors
/// - `HW1xx` - Shutdown reports
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "HW001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// Predefined diagnostics (HW0xx - Fatal heap errors)
// =============================================================================

/// HW001: Header sentinel or trailing guard overwritten.
pub const HW001: Diagnostic = Diagnostic::error(
    "HW001",
    "buffer overflow detected"
).with_note("the bytes just before this block, or its trailing guard, were overwritten")
 .with_help("look for an out-of-bounds write in the block allocated just before this one");

/// HW002: Block released (or resized) after it was already released.
pub const HW002: Diagnostic = Diagnostic::error(
    "HW002",
    "double release detected"
).with_note("the block's header says it was already released")
 .with_help("check ownership of the pointer; only one owner may free it");

/// HW003: The real allocator could not be located.
pub const HW003: Diagnostic = Diagnostic::error(
    "HW003",
    "resolution failed"
).with_note("dlsym(RTLD_NEXT) did not find the underlying allocator")
 .with_help("preload heapwarden into a dynamically linked program that uses the C allocator");

/// HW004: The underlying allocator returned null.
pub const HW004: Diagnostic = Diagnostic::error(
    "HW004",
    "out of memory"
).with_note("heapwarden treats allocation failure as unrecoverable");

// =============================================================================
// Predefined diagnostics (HW1xx - Shutdown reports)
// =============================================================================

/// HW101: Blocks still alive at shutdown.
pub const HW101: Diagnostic = Diagnostic::warning(
    "HW101",
    "leaks detected"
).with_help("set HEAPWARDEN_RECLAIM=0 to keep leaked blocks for an external analyzer");
