//! Fork behaviour.
//!
//! Children report through their exit status; they never panic or return
//! into the test harness.

use std::sync::Mutex;

use heapwarden::{process, LibcHeap, Tracker, TrackerConfig};

/// Forking while another test thread is mid-fork makes results hard to read.
static FORK_LOCK: Mutex<()> = Mutex::new(());

fn wait(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally: {status:#x}");
    libc::WEXITSTATUS(status)
}

fn child_exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

#[test]
fn test_explicit_hooks_isolate_child() {
    let _guard = FORK_LOCK.lock().unwrap();
    let t = Tracker::new(LibcHeap, TrackerConfig::default());
    let before = t.allocate(48);
    unsafe { before.as_ptr().write_bytes(0x33, 48) };

    t.prepare_fork();
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        unsafe { t.child_after_fork() };
        if t.epoch() != 1 || t.stats().contexts != 0 {
            child_exit(10);
        }

        let fresh = t.allocate(16);
        unsafe { t.release(before.as_ptr()) };
        let stats = t.stats();
        if (stats.contexts, stats.live_blocks, stats.live_bytes) != (1, 1, 16) {
            child_exit(11);
        }
        unsafe { t.release(fresh.as_ptr()) };
        match t.sweep_leaks() {
            Ok(report) if report.is_clean() => child_exit(0),
            _ => child_exit(12),
        }
    }

    unsafe { t.parent_after_fork() };
    assert_eq!(wait(pid), 0);

    // The parent's view is untouched by what the child did.
    assert_eq!(t.epoch(), 0);
    let stats = t.stats();
    assert_eq!((stats.live_blocks, stats.live_bytes), (1, 48));
    assert_eq!(unsafe { *before.as_ptr().add(47) }, 0x33);
    unsafe { t.release(before.as_ptr()) };
}

#[test]
fn test_installed_hooks_run_on_fork() {
    let _guard = FORK_LOCK.lock().unwrap();
    process::install();
    assert!(process::is_installed());
    assert!(!process::install());

    let tracker = process::tracker();
    let epoch = tracker.epoch();
    let before = tracker.allocate(100);

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        if tracker.epoch() != epoch + 1 {
            child_exit(20);
        }
        unsafe { tracker.release(before.as_ptr()) };
        let fresh = tracker.allocate(7);
        if tracker.stats().live_bytes != 7 {
            child_exit(21);
        }
        unsafe { tracker.release(fresh.as_ptr()) };
        child_exit(0);
    }

    assert_eq!(wait(pid), 0);
    assert_eq!(tracker.epoch(), epoch);
    assert!(tracker.stats().live_bytes >= 100);
    unsafe { tracker.release(before.as_ptr()) };
}

#[test]
fn test_fork_from_worker_thread() {
    let _guard = FORK_LOCK.lock().unwrap();
    let t = Tracker::new(LibcHeap, TrackerConfig::default());
    let main_block = t.allocate(32);
    let main_addr = main_block.as_ptr() as usize;

    let status = std::thread::scope(|s| {
        s.spawn(|| {
            let worker_block = t.allocate(64);
            t.prepare_fork();
            let pid = unsafe { libc::fork() };
            if pid == 0 {
                unsafe {
                    t.child_after_fork();
                    // Blocks from both parent threads are released in the child.
                    t.release(main_addr as *mut u8);
                    t.release(worker_block.as_ptr());
                }
                let ok = t.stats().live_blocks == 0;
                child_exit(if ok { 0 } else { 30 });
            }
            unsafe { t.parent_after_fork() };
            unsafe { t.release(worker_block.as_ptr()) };
            wait(pid)
        })
        .join()
        .unwrap()
    });

    assert_eq!(status, 0);
    unsafe { t.release(main_block.as_ptr()) };
    assert!(t.sweep_leaks().unwrap().is_clean());
}
