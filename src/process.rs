//! The process-wide tracker.
//!
//! Built on first use from `HEAPWARDEN_*` environment variables over the
//! real allocator found with `dlsym(RTLD_NEXT)`. Neither building it nor
//! reading the environment allocates, so first use may happen inside
//! `malloc`.
//!
//! [`install`] is the explicit bootstrap: it starts the lifecycle and
//! registers the `atexit` and `pthread_atfork` hooks. With the `interpose`
//! feature an ELF constructor calls it at load time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::allocators::{NextHeap, RawHeap};
use crate::api::config::TrackerConfig;
use crate::api::lifecycle::Lifecycle;
use crate::api::tracker::Tracker;

static LIFECYCLE: OnceLock<Lifecycle<NextHeap>> = OnceLock::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// The process lifecycle, built on first call.
pub fn lifecycle() -> &'static Lifecycle<NextHeap> {
    LIFECYCLE.get_or_init(|| {
        Lifecycle::new(Tracker::new(NextHeap::new(), TrackerConfig::from_env()))
    })
}

/// The process tracker.
pub fn tracker() -> &'static Tracker<NextHeap> {
    lifecycle().tracker()
}

/// Whether [`install`] has run.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Start tracking for the whole process.
///
/// Resolves the real allocator (fatal if that fails), registers the fork
/// and exit hooks, and starts the lifecycle. Only the first call does
/// anything; it returns false afterwards.
pub fn install() -> bool {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return false;
    }

    let lifecycle = lifecycle();
    let tracker = lifecycle.tracker();
    if let Err(err) = tracker.heap().ensure_ready() {
        tracker.fail(&err);
    }

    // SAFETY: the hooks are plain functions that live for the whole process.
    unsafe {
        libc::pthread_atfork(Some(prepare_fork), Some(parent_after_fork), Some(child_after_fork));
        libc::atexit(shutdown);
    }

    lifecycle.start()
}

unsafe extern "C" fn prepare_fork() {
    if let Some(lifecycle) = LIFECYCLE.get() {
        lifecycle.tracker().prepare_fork();
    }
}

unsafe extern "C" fn parent_after_fork() {
    if let Some(lifecycle) = LIFECYCLE.get() {
        lifecycle.tracker().parent_after_fork();
    }
}

unsafe extern "C" fn child_after_fork() {
    if let Some(lifecycle) = LIFECYCLE.get() {
        lifecycle.tracker().child_after_fork();
    }
}

extern "C" fn shutdown() {
    if let Some(lifecycle) = LIFECYCLE.get() {
        lifecycle.shutdown();
    }
}
