//! Shared helpers for the integration tests.
#![allow(dead_code)]

use phaseref::Counted;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Payload whose `Drop` decrements a shared live-object counter, so tests
/// observe finalization without writing bespoke finalizers.
pub struct Tracked {
    pub value: u32,
    live: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Allocate a managed object and bump the live counter.
pub fn make(live: &Arc<AtomicUsize>, value: u32) -> *mut Counted<Tracked> {
    live.fetch_add(1, Ordering::SeqCst);
    Counted::new(Tracked {
        value,
        live: live.clone(),
    })
}

/// Raw managed pointer that may cross threads.
#[derive(Clone, Copy)]
pub struct SendPtr(pub *mut Counted<Tracked>);

// SAFETY: the pointee is only touched through the library's read-section
// protocol.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialize the tests within one binary: grace periods are process-global,
/// and the count assertions assume no concurrent flusher.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Small deterministic PRNG for the stress tests.
pub fn xrand(state: &mut u32) -> u32 {
    *state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
    *state >> 16
}
