//! Per-thread state.
//!
//! ## Design
//!
//! - Each thread lazily allocates a [`ThreadRecord`] on first use of the
//!   API and links it into the global registry; the record's address is
//!   stable for the thread's lifetime.
//! - The record's `counter` packs a read-section nesting depth and the
//!   thread's local phase bit into one word: `(depth << 1) | phase`. A
//!   value of zero means "quiescent, phase 0".
//! - Two [`Cache`]s, indexed by phase bit, hold the thread's pending
//!   increments and decrements. The owning thread fills the cache selected
//!   by the current global phase; the grace-period engine drains the
//!   opposite one after proving no reader still runs in that phase. That
//!   hand-off is why the caches sit in `UnsafeCell`s rather than behind a
//!   lock.
//! - A thread-local handle's `Drop` merges and drains whatever is left in
//!   the caches and unlinks the record when the thread ends.

use crate::delta::DeltaTable;
use crate::list::ListNode;
use crate::registry::{self, Registry};
use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Low bit of the packed counters: the phase.
pub(crate) const PHASE_BIT: usize = 1;

/// One nesting level in the packed counter encoding.
pub(crate) const DEPTH_UNIT: usize = 1 << 1;

/// Classification of a reader record relative to the global phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderState {
    /// Not inside any read critical section.
    Inactive,
    /// In a critical section entered under the current global phase.
    Active,
    /// In a critical section entered under the previous global phase; a
    /// grace period must wait for it.
    Old,
}

/// One phase's worth of pending deltas, plus the flush watermark.
///
/// `flush` is zero when quiescent. Each near-full insert bumps it; a
/// successful flush clears it. Crossing one means "flush soon", crossing
/// two means "flush now".
pub(crate) struct Cache {
    pub incs: DeltaTable,
    pub decs: DeltaTable,
    pub flush: u32,
}

impl Cache {
    const fn new() -> Self {
        Self {
            incs: DeltaTable::new(),
            decs: DeltaTable::new(),
            flush: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.incs.is_empty() && self.decs.is_empty()
    }
}

/// A thread's node in the global registry.
///
/// `link` must stay the first field: registry scans recover the record from
/// a list node by pointer cast.
#[repr(C)]
pub(crate) struct ThreadRecord {
    pub link: ListNode,
    pub counter: AtomicUsize,
    caches: [UnsafeCell<Cache>; 2],
}

impl ThreadRecord {
    pub fn new() -> Self {
        Self {
            link: ListNode::new(),
            counter: AtomicUsize::new(0),
            caches: [UnsafeCell::new(Cache::new()), UnsafeCell::new(Cache::new())],
        }
    }

    /// The cache for `phase` (only the low bit is used).
    ///
    /// # Safety
    /// The caller must be either the owning thread touching its
    /// current-phase cache, or the grace-period engine draining a phase it
    /// has proven quiescent. The returned borrow must end before any call
    /// that can reach this cache again (a flush, a grace period).
    #[inline]
    pub unsafe fn cache_mut(&self, phase: usize) -> &mut Cache {
        // SAFETY: exclusivity comes from the phase protocol per above.
        unsafe { &mut *self.caches[phase & PHASE_BIT].get() }
    }

    /// Classify this reader against the global counter word.
    #[inline]
    pub fn state(&self, global: usize) -> ReaderState {
        let value = self.counter.load(Ordering::Acquire);
        if value >> 1 == 0 {
            ReaderState::Inactive
        } else if (value ^ global) & PHASE_BIT == 0 {
            ReaderState::Active
        } else {
            ReaderState::Old
        }
    }

    /// Recover the record from its embedded list node.
    ///
    /// # Safety
    /// `node` must be the `link` field of a live `ThreadRecord`.
    #[inline]
    pub unsafe fn from_link(node: *mut ListNode) -> *mut ThreadRecord {
        node as *mut ThreadRecord
    }
}

struct LocalHandle {
    rec: Cell<*mut ThreadRecord>,
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        let rec = self.rec.get();
        if !rec.is_null() {
            self.rec.set(ptr::null_mut());
            teardown(rec);
        }
    }
}

thread_local! {
    static LOCAL: LocalHandle = const {
        LocalHandle { rec: Cell::new(ptr::null_mut()) }
    };
}

/// Run `f` with the calling thread's record, registering it first if this
/// is the thread's first use of the API.
pub(crate) fn with_record<R>(f: impl FnOnce(&'static Registry, &ThreadRecord) -> R) -> R {
    LOCAL.with(|handle| {
        let reg = registry::registry();
        let mut rec = handle.rec.get();
        if rec.is_null() {
            rec = reg.register_current_thread();
            handle.rec.set(rec);
        }
        // SAFETY: the record stays live until this thread's teardown, which
        // cannot run while we are inside `with`.
        f(reg, unsafe { &*rec })
    })
}

/// The calling thread's record, or null if it never used the API (or was
/// already torn down). Never registers.
pub(crate) fn current_record() -> *mut ThreadRecord {
    LOCAL
        .try_with(|handle| handle.rec.get())
        .unwrap_or(ptr::null_mut())
}

/// Drain and unlink the calling thread's record, if any. Invoked from the
/// process-exit hook; thread exit goes through `LocalHandle::drop`.
pub(crate) fn teardown_current() {
    let _ = LOCAL.try_with(|handle| {
        let rec = handle.rec.get();
        if !rec.is_null() {
            handle.rec.set(ptr::null_mut());
            teardown(rec);
        }
    });
}

/// Thread teardown: merge the opposite-phase cache into the current one,
/// run grace periods until both phases are drained, then unlink and free
/// the record.
fn teardown(rec: *mut ThreadRecord) {
    let reg = registry::registry();

    // SAFETY: `rec` is this thread's live record.
    unsafe {
        (*rec).counter.store(0, Ordering::Release);
    }

    let _gp = reg.gp_lock().lock();
    let mut td = reg.td_lock().lock();

    let mut idx = reg.counter_word() & PHASE_BIT;
    // SAFETY: the thread is quiescent (counter zeroed above) and we hold
    // both registry locks, so nothing else touches these caches except the
    // grace periods we run ourselves.
    let pending = unsafe {
        let cur = (*rec).cache_mut(idx);
        let other = (*rec).cache_mut(idx ^ PHASE_BIT);
        cur.incs.merge(&mut other.incs);
        cur.decs.merge(&mut other.decs);
        !cur.is_empty()
    };
    if pending {
        td = reg.sync_body(td);
    }

    // The merge stops early if the destination fills up; a second grace
    // period picks up whatever stayed in the opposite phase.
    idx ^= PHASE_BIT;
    // SAFETY: as above.
    let pending = unsafe { !(*rec).cache_mut(idx).is_empty() };
    if pending {
        td = reg.sync_body(td);
    }

    // SAFETY: still holding td_lock; the record is linked and quiescent.
    unsafe {
        ListNode::unlink((*rec).link.as_ptr());
    }
    reg.note_thread_unregistered();

    #[cfg(feature = "ref_logging")]
    tracing::trace!(target: "phaseref::thread", "thread record drained and unlinked");

    drop(td);
    drop(_gp);

    // SAFETY: the record is unlinked, so no registry scan can reach it, and
    // the owning thread is done with it.
    drop(unsafe { Box::from_raw(rec) });
}
