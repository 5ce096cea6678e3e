//! Thread teardown: a dying thread's pending deltas are applied and its
//! record leaves the registry.

mod common;

use common::{SendPtr, make, serial};
use phaseref::{acquire, flush, read_enter, read_exit, release, stats};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn thread_exit_drains_pending_deltas() {
    let _serial = serial();
    phaseref::init().expect("init");

    let live = Arc::new(AtomicUsize::new(0));
    let shared = make(&live, 5);
    let ptr = SendPtr(shared);
    let live_in_worker = live.clone();

    let threads_before = stats().registered_threads;

    thread::spawn(move || {
        let ptr = ptr;
        read_enter();
        // SAFETY: the object is live (the main thread holds its initial
        // reference); the acquires are balanced.
        unsafe {
            acquire(ptr.0);
            acquire(ptr.0);
            release(ptr.0);
            release(ptr.0);
        }
        read_exit();
        // Nothing forced a flush, so the deltas are still cached here and
        // the object is untouched; thread teardown must apply them.
        assert_eq!(live_in_worker.load(Ordering::SeqCst), 1);
    })
    .join()
    .expect("worker");

    assert_eq!(
        stats().registered_threads,
        threads_before,
        "the dead thread's record must be unregistered"
    );
    assert_eq!(live.load(Ordering::SeqCst), 1);

    // SAFETY: drops the initial reference.
    unsafe { release(shared) };
    flush().expect("outside any read section");
    assert_eq!(live.load(Ordering::SeqCst), 0, "the worker's deltas were applied exactly once");
}
