//! Tracker configuration.

use std::ffi::CStr;

/// How a fatal heap error ends the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalAction {
    /// `_exit(code)`: no unwinding, no `atexit` handlers.
    Exit(i32),
    /// `abort()`, for a core dump.
    Abort,
}

impl Default for FatalAction {
    fn default() -> Self {
        FatalAction::Exit(1)
    }
}

/// Environment variable names read by [`TrackerConfig::from_env`].
pub mod env {
    use std::ffi::CStr;

    /// `0`/`1`: reclaim leaked blocks at shutdown.
    pub const RECLAIM: &CStr = c"HEAPWARDEN_RECLAIM";
    /// `1`: append a guard word after every block.
    pub const GUARD: &CStr = c"HEAPWARDEN_GUARD";
    /// `1`: fill fresh and released memory with marker bytes.
    pub const POISON: &CStr = c"HEAPWARDEN_POISON";
    /// `1`: fatal errors call `abort()`.
    pub const ABORT: &CStr = c"HEAPWARDEN_ABORT";
    /// Integer exit status to use when leaks are found.
    pub const LEAK_EXIT: &CStr = c"HEAPWARDEN_LEAK_EXIT";
    /// `1`: do not print the leak summary.
    pub const QUIET: &CStr = c"HEAPWARDEN_QUIET";
}

/// Configuration for a [`Tracker`](crate::Tracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Free blocks still alive at shutdown (default: true).
    ///
    /// When false they stay allocated and linked, for an external analyzer.
    pub reclaim_leaks: bool,

    /// Append an 8-byte guard word after each user region and check it
    /// alongside the header sentinel (default: false)
    pub trailing_guard: bool,

    /// Poison fresh and released user memory (default: on with the `debug` feature)
    pub poison: bool,

    /// What fatal errors do (default: `_exit(1)`)
    pub fatal_action: FatalAction,

    /// Exit status to force when the shutdown sweep finds leaks
    pub leak_exit_code: Option<i32>,

    /// Print the leak summary (default: true)
    pub report_leaks: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerConfig {
    /// The default configuration, usable in `const` context.
    pub const fn new() -> Self {
        Self {
            reclaim_leaks: true,
            trailing_guard: false,
            poison: cfg!(feature = "debug"),
            fatal_action: FatalAction::Exit(1),
            leak_exit_code: None,
            report_leaks: true,
        }
    }

    /// Everything on: guard words, poisoning, and a failing exit status when
    /// anything leaks.
    pub const fn strict() -> Self {
        Self {
            reclaim_leaks: true,
            trailing_guard: true,
            poison: true,
            fatal_action: FatalAction::Exit(1),
            leak_exit_code: Some(1),
            report_leaks: true,
        }
    }

    /// Read the configuration from `HEAPWARDEN_*` environment variables.
    ///
    /// Does not allocate, so it can run before the real allocator is bound.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| {
            // SAFETY: key is NUL-terminated; a non-null result points at a
            // NUL-terminated string in the environment block.
            unsafe {
                let value = libc::getenv(key.as_ptr());
                if value.is_null() {
                    None
                } else {
                    Some(CStr::from_ptr(value).to_bytes())
                }
            }
        })
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unknown or malformed values keep their defaults.
    pub fn from_lookup<'a>(mut lookup: impl FnMut(&'static CStr) -> Option<&'a [u8]>) -> Self {
        let mut config = Self::new();

        if let Some(reclaim) = lookup(env::RECLAIM).and_then(parse_flag) {
            config.reclaim_leaks = reclaim;
        }
        if let Some(guard) = lookup(env::GUARD).and_then(parse_flag) {
            config.trailing_guard = guard;
        }
        if let Some(poison) = lookup(env::POISON).and_then(parse_flag) {
            config.poison = poison;
        }
        if let Some(true) = lookup(env::ABORT).and_then(parse_flag) {
            config.fatal_action = FatalAction::Abort;
        }
        if let Some(code) = lookup(env::LEAK_EXIT).and_then(parse_code) {
            config.leak_exit_code = Some(code);
        }
        if let Some(quiet) = lookup(env::QUIET).and_then(parse_flag) {
            config.report_leaks = !quiet;
        }

        config
    }

    /// Builder pattern: reclaim leaked blocks at shutdown.
    pub const fn with_reclaim_leaks(mut self, reclaim: bool) -> Self {
        self.reclaim_leaks = reclaim;
        self
    }

    /// Builder pattern: enable the trailing guard word.
    pub const fn with_trailing_guard(mut self, enable: bool) -> Self {
        self.trailing_guard = enable;
        self
    }

    /// Builder pattern: enable memory poisoning.
    pub const fn with_poison(mut self, enable: bool) -> Self {
        self.poison = enable;
        self
    }

    /// Builder pattern: set the fatal action.
    pub const fn with_fatal_action(mut self, action: FatalAction) -> Self {
        self.fatal_action = action;
        self
    }

    /// Builder pattern: exit with `code` when leaks are found.
    pub const fn with_leak_exit_code(mut self, code: Option<i32>) -> Self {
        self.leak_exit_code = code;
        self
    }

    /// Builder pattern: print the leak summary.
    pub const fn with_report_leaks(mut self, report: bool) -> Self {
        self.report_leaks = report;
        self
    }
}

fn parse_flag(value: &[u8]) -> Option<bool> {
    match value {
        b"1" | b"true" | b"yes" | b"on" => Some(true),
        b"0" | b"false" | b"no" | b"off" => Some(false),
        _ => None,
    }
}

/// A non-zero exit status; `0` means "leaks do not change the status".
fn parse_code(value: &[u8]) -> Option<i32> {
    let code: i32 = std::str::from_utf8(value).ok()?.trim().parse().ok()?;
    (1..=255).contains(&code).then_some(code)
}
