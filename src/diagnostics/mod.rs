//! Diagnostics.
//!
//! Every message heapwarden prints goes through this module:
//! - **Fatal errors**: one line plus note and help, then immediate termination
//! - **Leak summary**: one line at shutdown, only when something leaked
//!
//! Output never allocates and never takes a lock, so it is safe from inside
//! `malloc`, from `atexit` and `pthread_atfork` handlers, and from signal
//! handlers.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | HW0xx | Fatal heap errors              |
//! | HW1xx | Shutdown reports               |

pub mod emit;
pub mod kind;

pub use emit::{emit_leak_report, fatal, is_suppressed, suppress_diagnostics, LineBuffer};
pub use kind::{Diagnostic, DiagnosticKind};
pub use kind::{HW001, HW002, HW003, HW004, HW101};
