//! Fork support.
//!
//! Forking a multithreaded process leaves only the calling thread alive in
//! the child; every other thread's record, cache, and pending deltas are
//! gone. These hooks hold both registry locks across the fork so the child
//! never inherits a lock frozen mid-critical-section, then rebuild the
//! registry around the surviving thread.

use crate::error::Error;
use crate::registry::registry;
use crate::thread;
use std::mem;

/// The three callbacks to wire into the host's fork machinery.
#[derive(Clone, Copy)]
pub struct ForkHooks {
    /// Call before forking.
    pub prepare: fn(),
    /// Call in the parent after forking.
    pub parent: fn(),
    /// Call in the child after forking.
    pub child: fn(),
}

/// The registry's fork callbacks.
pub fn fork_hooks() -> ForkHooks {
    ForkHooks {
        prepare: hooks_prepare,
        parent: hooks_parent,
        child: hooks_child,
    }
}

fn hooks_prepare() {
    let reg = registry();
    // Hold both locks across the fork; they are released by the parent or
    // child hook, so the guards must outlive this frame.
    mem::forget(reg.gp_lock().lock());
    mem::forget(reg.td_lock().lock());
}

fn hooks_parent() {
    // SAFETY: prepare acquired both locks.
    unsafe { registry().force_unlock_both() };
}

fn hooks_child() {
    let reg = registry();
    // SAFETY: prepare acquired both locks, and a freshly forked child is
    // single-threaded.
    unsafe {
        reg.force_unlock_both();
        reg.reset_after_fork(thread::current_record());
    }
}

/// Register the fork callbacks with `pthread_atfork`. Safe to call more
/// than once, though each call stacks another registration.
#[cfg(unix)]
pub fn install_fork_hooks() -> Result<(), Error> {
    unsafe extern "C" fn prepare_cb() {
        hooks_prepare();
    }
    unsafe extern "C" fn parent_cb() {
        hooks_parent();
    }
    unsafe extern "C" fn child_cb() {
        hooks_child();
    }

    // SAFETY: the callbacks are `extern "C"` fns with static lifetime.
    let rc = unsafe { libc::pthread_atfork(Some(prepare_cb), Some(parent_cb), Some(child_cb)) };
    if rc == 0 { Ok(()) } else { Err(Error::ForkHandler) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_parent_roundtrip() {
        let hooks = fork_hooks();
        (hooks.prepare)();
        // Both locks are held now; parent releases them.
        (hooks.parent)();
        // The registry is usable again.
        crate::flush().expect("registry unlocked");
    }
}
