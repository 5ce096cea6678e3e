//! Read-side critical sections and the batched acquire/release protocol.
//!
//! Readers bracket their pointer accesses with [`read_enter`] /
//! [`read_exit`] (or the RAII [`read`] guard). Inside a section,
//! [`acquire`] and [`release`] record +1/-1 deltas in the thread's
//! current-phase cache; nothing touches the object's shared count until a
//! grace period applies the batch. Entering and exiting cost one release
//! store each.

use crate::error::Error;
use crate::object::{RefHeader, Refcounted};
use crate::registry::Registry;
use crate::thread::{self, DEPTH_UNIT, PHASE_BIT, ThreadRecord};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

/// Enter a read critical section. Nests.
///
/// The release store publishes the thread's reader state to the
/// grace-period engine: writes made inside the section are ordered after
/// the enter from the engine's point of view.
#[inline]
pub fn read_enter() {
    thread::with_record(|reg, rec| {
        let mut value = rec.counter.load(Ordering::Relaxed);
        if value >> 1 == 0 {
            // Outermost enter: adopt the current global phase. A grace
            // period has elapsed since the last section, so a stale
            // near-full mark on that phase's cache is moot.
            value = reg.counter_word();
            // SAFETY: owning thread, current phase.
            unsafe { rec.cache_mut(value & PHASE_BIT) }.flush = 0;
        }

        let nval = value + DEPTH_UNIT;
        assert!(nval > value, "read section nesting depth overflow");
        rec.counter.store(nval, Ordering::Release);
    });
}

/// Exit a read critical section.
///
/// Leaving the outermost level runs any flush that was deferred while the
/// section was active.
#[inline]
pub fn read_exit() {
    thread::with_record(|reg, rec| {
        let value = rec.counter.load(Ordering::Relaxed);
        assert!(value >> 1 != 0, "read_exit without a matching read_enter");

        let value = value - DEPTH_UNIT;
        rec.counter.store(value, Ordering::Release);

        if value >> 1 == 0 {
            // SAFETY: owning thread, now quiescent.
            let pending = unsafe { rec.cache_mut(value & PHASE_BIT) }.flush != 0;
            if pending {
                let _ = flush_record(reg, rec, value);
            }
        }
    });
}

/// RAII read critical section; exits on drop. Not sendable: the section
/// belongs to the thread that opened it.
pub struct ReadGuard {
    _not_send: PhantomData<*mut ()>,
}

/// Enter a read critical section, returning a guard that exits it.
pub fn read() -> ReadGuard {
    read_enter();
    ReadGuard {
        _not_send: PhantomData,
    }
}

impl ReadGuard {
    /// [`acquire`], tied to this section.
    ///
    /// # Safety
    /// As for [`acquire`].
    pub unsafe fn acquire<T: Refcounted>(&self, ptr: *mut T) -> *mut T {
        // SAFETY: forwarded to the caller.
        unsafe { acquire(ptr) }
    }

    /// [`release`], tied to this section.
    ///
    /// # Safety
    /// As for [`release`].
    pub unsafe fn release<T: Refcounted>(&self, ptr: *mut T) {
        // SAFETY: forwarded to the caller.
        unsafe { release(ptr) }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        read_exit();
    }
}

/// Batch a +1 for `ptr` and return it, so call sites can write
/// `let p = acquire(slot.load(Ordering::Acquire))`.
///
/// # Safety
/// `ptr` must point to a live managed object, obtained inside the current
/// read critical section; the object must stay unused once the section
/// exits unless the acquire is balanced by a later release.
#[inline]
pub unsafe fn acquire<T: Refcounted>(ptr: *mut T) -> *mut T {
    // SAFETY: caller guarantees `ptr` is live.
    let header = unsafe { (*ptr).header().as_ptr() };
    // SAFETY: as above.
    unsafe { acq_rel(header, 1, false) };
    ptr
}

/// Batch a -1 for `ptr`.
///
/// # Safety
/// `ptr` must point to a live managed object the caller holds a reference
/// to; that reference must not be used afterwards.
#[inline]
pub unsafe fn release<T: Refcounted>(ptr: *mut T) {
    // SAFETY: caller guarantees `ptr` is live.
    let header = unsafe { (*ptr).header().as_ptr() };
    // SAFETY: as above.
    unsafe { acq_rel(header, -1, true) };
}

/// Run a grace period now and apply every thread's pending deltas.
///
/// Inside a read critical section this fails with
/// [`Error::ReadSectionActive`] and arms the deferred flush instead; the
/// closing [`read_exit`] will retry.
pub fn flush() -> Result<(), Error> {
    thread::with_record(|reg, rec| {
        let value = rec.counter.load(Ordering::Relaxed);
        let result = flush_record(reg, rec, value);
        if result.is_err() {
            // SAFETY: owning thread, current local phase.
            unsafe { rec.cache_mut(value & PHASE_BIT) }.flush = 1;
        }
        result
    })
}

fn flush_record(reg: &'static Registry, rec: &ThreadRecord, value: usize) -> Result<(), Error> {
    if value >> 1 != 0 {
        return Err(Error::ReadSectionActive);
    }

    // SAFETY: owning thread, quiescent.
    unsafe { rec.cache_mut(value & PHASE_BIT) }.flush = 0;
    reg.sync();
    Ok(())
}

unsafe fn acq_rel(header: *mut RefHeader, delta: isize, dec: bool) {
    assert!(!header.is_null(), "null managed pointer");

    thread::with_record(|reg, rec| {
        let phase = reg.counter_word() & PHASE_BIT;
        let (outcome, flush) = {
            // SAFETY: owning thread, current phase; the borrow ends before
            // any flush below can re-reach this cache.
            let cache = unsafe { rec.cache_mut(phase) };
            let table = if dec { &mut cache.decs } else { &mut cache.incs };
            let outcome = table.add(header, delta);
            cache.flush += outcome.near_full as u32;
            (outcome, cache.flush)
        };

        if flush > 1 && flush_record(reg, rec, rec.counter.load(Ordering::Relaxed)).is_err() {
            // The cache is full, but this thread sits inside a read
            // section and cannot wait out a grace period on itself. Back
            // the pending delta out of the table and apply it directly
            // under the thread-list lock, parking the object for the next
            // review pass. If the add above merged into an earlier slot,
            // the whole accumulated delta moves with it.
            let entry = {
                // SAFETY: as for the insert above.
                let cache = unsafe { rec.cache_mut(phase) };
                let table = if dec { &mut cache.decs } else { &mut cache.incs };
                table.remove_slot(outcome.slot)
            };
            assert_eq!(entry.ptr, header, "emergency slot mismatch");

            let _td = reg.td_lock().lock();
            // SAFETY: the caller holds the object inside a read section, so
            // it is live; td_lock serializes the count and the review list.
            unsafe {
                (*header).refcnt.set((*header).refcnt.get() + entry.delta);
                reg.review_push(header);
            }
            reg.note_emergency();

            #[cfg(feature = "ref_logging")]
            tracing::debug!(
                target: "phaseref::review",
                ptr = header as usize,
                "cache full inside read section; pointer parked for review"
            );
        }
    });
}
