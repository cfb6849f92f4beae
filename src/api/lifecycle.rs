//! Explicit start/stop lifecycle.
//!
//! Whoever owns process bootstrap (the ELF constructor in the preloaded
//! library, or a test harness) calls [`Lifecycle::start`], and later
//! [`Lifecycle::stop`] or [`Lifecycle::shutdown`] at exit.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::allocators::RawHeap;
use crate::api::error::HeapError;
use crate::api::stats::LeakReport;
use crate::api::tracker::Tracker;
use crate::diagnostics;

/// Phase of a [`Lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Built but not started.
    Idle = 0,
    /// Tracking.
    Running = 1,
    /// Swept and finalized.
    Stopped = 2,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Phase::Idle,
            1 => Phase::Running,
            _ => Phase::Stopped,
        }
    }
}

/// Owns a tracker and drives it through Idle → Running → Stopped.
pub struct Lifecycle<H: RawHeap> {
    tracker: Tracker<H>,
    phase: AtomicU8,
}

impl<H: RawHeap> Lifecycle<H> {
    /// Wrap a tracker. Nothing happens until [`start`](Self::start).
    pub fn new(tracker: Tracker<H>) -> Self {
        Self {
            tracker,
            phase: AtomicU8::new(Phase::Idle as u8),
        }
    }

    /// The tracker being driven.
    pub fn tracker(&self) -> &Tracker<H> {
        &self.tracker
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Move Idle → Running. Returns false if already started or stopped.
    pub fn start(&self) -> bool {
        let started = self
            .phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        #[cfg(feature = "log")]
        if started {
            log::debug!("heapwarden: tracker {} running", self.tracker.id());
        }

        started
    }

    /// Finalize the tracker and sweep it.
    ///
    /// The leak summary is printed when something leaked and the config asks
    /// for it. Returns `None` if the lifecycle was already stopped.
    pub fn stop(&self) -> Result<Option<LeakReport>, HeapError> {
        let previous = self.phase.swap(Phase::Stopped as u8, Ordering::AcqRel);
        if Phase::from_raw(previous) == Phase::Stopped {
            return Ok(None);
        }

        self.tracker.set_finalized();
        let report = self.tracker.sweep_leaks()?;

        if self.tracker.config().report_leaks {
            diagnostics::emit_leak_report(&report);
        }

        #[cfg(feature = "log")]
        if !report.is_clean() {
            diagnostics::emit::emit_to_log(&diagnostics::HW101, format_args!("{}", report));
        }

        Ok(Some(report))
    }

    /// The exit status leaks should force, if any.
    pub fn leak_exit_status(&self, report: &LeakReport) -> Option<i32> {
        if report.is_clean() {
            None
        } else {
            self.tracker.config().leak_exit_code
        }
    }

    /// [`stop`](Self::stop) for process exit.
    ///
    /// Integrity errors found by the sweep are fatal. When leaks map to an
    /// exit status, stdio is flushed and the process ends with it.
    pub fn shutdown(&self) {
        let report = match self.stop() {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(err) => self.tracker.fail(&err),
        };

        if let Some(code) = self.leak_exit_status(&report) {
            // SAFETY: fflush(NULL) flushes every stream; _exit never returns.
            unsafe {
                libc::fflush(std::ptr::null_mut());
                libc::_exit(code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::LibcHeap;
    use crate::api::config::TrackerConfig;
    use crate::diagnostics::suppress_diagnostics;

    fn lifecycle(config: TrackerConfig) -> Lifecycle<LibcHeap> {
        Lifecycle::new(Tracker::new(LibcHeap, config.with_report_leaks(false)))
    }

    #[test]
    fn test_phases() {
        let lc = lifecycle(TrackerConfig::new());
        assert_eq!(lc.phase(), Phase::Idle);

        assert!(lc.start());
        assert!(!lc.start());
        assert_eq!(lc.phase(), Phase::Running);

        assert_eq!(lc.stop(), Ok(Some(LeakReport { blocks: 0, bytes: 0, reclaimed: true })));
        assert_eq!(lc.phase(), Phase::Stopped);
        assert!(lc.tracker().is_finalized());

        assert_eq!(lc.stop(), Ok(None));
        assert!(!lc.start());
    }

    #[test]
    fn test_stop_reports_leaks() {
        suppress_diagnostics(true);
        let lc = lifecycle(TrackerConfig::new());
        lc.start();

        let a = lc.tracker().allocate(32);
        let _b = lc.tracker().zero_allocate(1, 64);
        unsafe { lc.tracker().release(a.as_ptr()) };

        let report = lc.stop().unwrap().unwrap();
        assert_eq!(report.to_string(), "1 blocks / 64 bytes leaked");
        suppress_diagnostics(false);
    }

    #[test]
    fn test_leak_exit_status() {
        let lc = lifecycle(TrackerConfig::new().with_leak_exit_code(Some(3)));
        let leaked = LeakReport { blocks: 2, bytes: 8, reclaimed: true };

        assert_eq!(lc.leak_exit_status(&leaked), Some(3));
        assert_eq!(lc.leak_exit_status(&LeakReport::default()), None);

        let relaxed = lifecycle(TrackerConfig::new());
        assert_eq!(relaxed.leak_exit_status(&leaked), None);
    }
}
