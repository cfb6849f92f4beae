//! The exported C allocator.
//!
//! With the `interpose` feature this test binary's own `malloc` family is
//! bound to heapwarden, so every call below goes through the process
//! tracker. The test harness allocates concurrently, so counters are checked
//! as lower bounds.
//!
//! Run with: cargo test --features interpose --test interpose_tests

#![cfg(feature = "interpose")]

use std::ffi::c_void;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::ptr;

use heapwarden::{process, Phase};

extern "C" {
    fn malloc(size: usize) -> *mut c_void;
    fn calloc(count: usize, size: usize) -> *mut c_void;
    fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
    fn free(ptr: *mut c_void);
    fn cfree(ptr: *mut c_void);
    fn posix_memalign(memptr: *mut *mut c_void, align: usize, size: usize) -> i32;
    fn aligned_alloc(align: usize, size: usize) -> *mut c_void;
    fn valloc(size: usize) -> *mut c_void;
    fn pvalloc(size: usize) -> *mut c_void;
    fn malloc_usable_size(ptr: *mut c_void) -> usize;
}

const SCENARIO: &str = "HEAPWARDEN_INTERPOSE_SCENARIO";

fn page() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[test]
fn test_process_tracker_is_running() {
    // The load-time constructor normally got here first.
    process::install();
    assert!(process::is_installed());
    assert_eq!(process::lifecycle().phase(), Phase::Running);

    unsafe { free(malloc(1)) };
    assert!(process::tracker().heap().is_resolved());
}

#[test]
fn test_c_family_goes_through_tracker() {
    let tracker = process::tracker();
    let before = tracker.stats();

    unsafe {
        let a = malloc(100);
        assert_eq!(malloc_usable_size(a), 100);

        let z = calloc(4, 25).cast::<u8>();
        assert!(std::slice::from_raw_parts(z, 100).iter().all(|b| *b == 0));

        a.cast::<u8>().write_bytes(0x42, 100);
        let grown = realloc(a, 5000);
        assert_eq!(malloc_usable_size(grown), 5000);
        assert_eq!(*grown.cast::<u8>().add(99), 0x42);

        let mut aligned = ptr::null_mut();
        assert_eq!(posix_memalign(&mut aligned, 256, 64), 0);
        assert_eq!(aligned as usize % 256, 0);
        assert_eq!(posix_memalign(&mut aligned as *mut _, 24, 64), libc::EINVAL);

        let al = aligned_alloc(64, 128);
        assert_eq!(al as usize % 64, 0);

        let v = valloc(10);
        assert_eq!(v as usize % page(), 0);
        assert_eq!(malloc_usable_size(v), 10);

        let pv = pvalloc(100);
        assert_eq!(pv as usize % page(), 0);
        assert_eq!(malloc_usable_size(pv), page());

        let stats = tracker.stats();
        assert!(stats.allocations >= before.allocations + 7);

        for p in [grown, z.cast(), aligned, al, v] {
            free(p);
        }
        cfree(pv);
        free(ptr::null_mut());
        assert_eq!(malloc_usable_size(ptr::null_mut()), 0);
    }

    assert!(tracker.stats().releases >= before.releases + 7);
}

#[test]
fn test_pvalloc_zero_is_one_page() {
    unsafe {
        let p = pvalloc(0);
        assert_eq!(malloc_usable_size(p), page());
        free(p);
    }
}

#[test]
fn test_std_allocations_are_tracked() {
    let tracker = process::tracker();
    let before = tracker.stats().allocations;
    let boxed = vec![7u8; 4096];
    assert!(tracker.stats().allocations > before);
    drop(boxed);
}

/// Re-executed entry point for the fatal scenario below.
#[test]
fn scenario_entry() {
    if std::env::var_os(SCENARIO).is_none() {
        return;
    }
    unsafe {
        let p = malloc(16);
        free(p);
        free(p);
    }
    eprintln!("unreachable: second free returned");
}

#[test]
fn test_double_free_through_c_symbols() {
    let out = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "scenario_entry", "--nocapture", "--test-threads=1"])
        .env(SCENARIO, "1")
        .output()
        .unwrap();

    let err = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(1), "{err}");
    assert!(out.status.signal().is_none());
    assert!(err.contains("[heapwarden][HW002] error: double release detected"), "{err}");
    assert!(!err.contains("unreachable"));
}
