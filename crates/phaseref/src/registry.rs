//! Global thread registry and grace-period engine.
//!
//! ## Design
//!
//! - A process-global registry owns the intrusive list of all live thread
//!   records, the one-bit global phase counter, and an emergency "review"
//!   list of objects whose counts were adjusted outside the cache path.
//! - Two locks: `td_lock` guards list and review membership (and the
//!   emergency count mutation); `gp_lock` serializes grace periods. Lock
//!   order is always `gp_lock` before `td_lock`.
//! - A grace period is a two-pass scan. Pass one classifies every reader
//!   and parks the ones active in the current phase on a side list; the
//!   phase then flips; pass two waits for the parked readers to exit or
//!   re-enter under the new phase. After that, no reader can still be
//!   filling the old phase's caches, so they are drained: all increments
//!   first, then all decrements, so a paired +1/-1 recorded in the same
//!   phase never produces a transient zero that would finalize a live
//!   object.

use crate::list::ListNode;
use crate::object::RefHeader;
use crate::thread::{PHASE_BIT, ReaderState, ThreadRecord};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::ptr;
use std::sync::Once;
use std::sync::atomic::{self, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Unproductive scan iterations before the engine stops spinning and
/// sleeps for a millisecond.
const POLL_SPINS: u32 = 1000;

/// Terminator for the review list. A parked object is recognizable by a
/// non-null `review_next`, so the chain cannot end in null; the tail points
/// here instead.
static REVIEW_TAIL: RefHeader = RefHeader::new(None);

#[inline]
fn review_tail() -> *mut RefHeader {
    REVIEW_TAIL.as_ptr()
}

pub(crate) struct Registry {
    /// Global counter; only the low bit (the phase) is meaningful. Padded
    /// so the relaxed load on every acquire/release does not false-share
    /// with the lock words.
    counter: CachePadded<AtomicUsize>,
    /// Head of the thread-record list. Guarded by `td_lock`.
    root: ListNode,
    /// Head of the review list, null when empty. Guarded by `td_lock`.
    review: Cell<*mut RefHeader>,
    td_lock: Mutex<()>,
    gp_lock: Mutex<()>,
    threads: AtomicUsize,
    grace_periods: AtomicU64,
    emergencies: AtomicU64,
}

// SAFETY: `root` and `review` are only touched under `td_lock`; everything
// else is atomic.
unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry::new();
static REGISTRY_INIT: Once = Once::new();

/// The process-global registry, list head initialized.
pub(crate) fn registry() -> &'static Registry {
    REGISTRY_INIT.call_once(|| REGISTRY.root.init_head());
    &REGISTRY
}

impl Registry {
    const fn new() -> Self {
        Self {
            counter: CachePadded::new(AtomicUsize::new(0)),
            root: ListNode::new(),
            review: Cell::new(ptr::null_mut()),
            td_lock: Mutex::new(()),
            gp_lock: Mutex::new(()),
            threads: AtomicUsize::new(0),
            grace_periods: AtomicU64::new(0),
            emergencies: AtomicU64::new(0),
        }
    }

    /// Current counter word (relaxed). Mask with [`PHASE_BIT`] for the
    /// phase.
    #[inline]
    pub fn counter_word(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn td_lock(&self) -> &Mutex<()> {
        &self.td_lock
    }

    pub fn gp_lock(&self) -> &Mutex<()> {
        &self.gp_lock
    }

    /// Allocate and link a record for the calling thread.
    pub fn register_current_thread(&'static self) -> *mut ThreadRecord {
        let rec = Box::into_raw(Box::new(ThreadRecord::new()));
        let _td = self.td_lock.lock();
        // SAFETY: the record is fresh and unlinked, and we hold td_lock.
        unsafe {
            self.root.insert_front((*rec).link.as_ptr());
        }
        self.threads.fetch_add(1, Ordering::Relaxed);
        rec
    }

    pub fn note_thread_unregistered(&self) {
        self.threads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn note_emergency(&self) {
        self.emergencies.fetch_add(1, Ordering::Relaxed);
    }

    /// Park `header` on the review list unless it is already there.
    ///
    /// # Safety
    /// The caller must hold `td_lock` and `header` must be live.
    pub unsafe fn review_push(&self, header: *mut RefHeader) {
        // SAFETY: td_lock serializes review membership.
        unsafe {
            if (*header).review_next.get().is_null() {
                let head = self.review.get();
                let next = if head.is_null() { review_tail() } else { head };
                (*header).review_next.set(next);
                self.review.set(header);
            }
        }
    }

    /// Walk the review list: unpark objects that are still referenced,
    /// finalize the ones whose count reached zero.
    ///
    /// # Safety
    /// The caller must hold `td_lock`; the emergency path mutates counts
    /// under the same lock, so zero observed here is final.
    unsafe fn drain_review(&self) {
        let tail = review_tail();
        let mut run = self.review.get();
        while !run.is_null() && run != tail {
            // SAFETY: parked objects are live until finalized here.
            unsafe {
                let next = (*run).review_next.get();
                if (*run).refcnt.get() != 0 {
                    (*run).review_next.set(ptr::null_mut());
                } else if let Some(fini) = (*run).fini.get() {
                    fini(run);
                }
                run = next;
            }
        }
        self.review.set(ptr::null_mut());
    }

    /// Run a full grace period and apply every pending delta.
    pub fn sync(&'static self) {
        let _gp = self.gp_lock.lock();
        let td = self.td_lock.lock();
        let _td = self.sync_body(td);
    }

    /// Grace-period body. The caller holds `gp_lock` and passes in the
    /// `td_lock` guard, which may be dropped and re-taken while waiting for
    /// old-phase readers; the (re-acquired) guard is returned.
    pub fn sync_body(
        &'static self,
        mut td: MutexGuard<'static, ()>,
    ) -> MutexGuard<'static, ()> {
        if self.root.is_empty_head() {
            return td;
        }

        #[cfg(feature = "ref_logging")]
        tracing::debug!(
            target: "phaseref::gp",
            phase = self.counter_word() & PHASE_BIT,
            "grace period starting"
        );

        // Make the caller's prior writes visible before classifying any
        // reader.
        atomic::fence(Ordering::SeqCst);

        let out = ListNode::new();
        let qs = ListNode::new();
        out.init_head();
        qs.init_head();

        // Pass one: drain the main list. Readers active in the current
        // phase are parked on `out` for a second look; quiescent ones go
        // straight to `qs`; old-phase readers are waited out in place.
        td = self.poll(td, &self.root, Some(&out), &qs);

        let prev = self.counter.load(Ordering::Relaxed);
        self.counter.store(prev ^ PHASE_BIT, Ordering::Release);

        // Pass two: the parked readers now carry the stale phase. Wait for
        // each to exit or re-enter under the new phase.
        td = self.poll(td, &out, None, &qs);

        // SAFETY: both heads are initialized and we hold td_lock.
        unsafe {
            qs.splice_into(&self.root);
        }

        // No reader can still touch the pre-flip phase's caches. Apply
        // increments before decrements so a +1/-1 pair recorded in the
        // same phase never dips to zero in between.
        let idx = prev & PHASE_BIT;
        let head = self.root.as_ptr();
        // SAFETY: records stay linked and live while td_lock is held, and
        // the two-pass scan above proved the old phase quiescent.
        unsafe {
            let mut run = self.root.next();
            while run != head {
                let rec = ThreadRecord::from_link(run);
                (*rec).cache_mut(idx).incs.drain(false);
                run = (*run).next();
            }

            let mut run = self.root.next();
            while run != head {
                let rec = ThreadRecord::from_link(run);
                (*rec).cache_mut(idx).decs.drain(true);
                run = (*run).next();
            }

            self.drain_review();
        }

        self.grace_periods.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "ref_logging")]
        tracing::debug!(
            target: "phaseref::gp",
            completed = self.grace_periods.load(Ordering::Relaxed),
            "grace period complete"
        );

        td
    }

    /// Repeatedly classify the readers on `readers` until the list is
    /// empty. Active readers move to `out` when given (pass one) or to
    /// `qs` otherwise (pass two, where "active" means re-entered under the
    /// new phase); inactive readers move to `qs`; old-phase readers stay
    /// put until they exit.
    fn poll(
        &'static self,
        mut td: MutexGuard<'static, ()>,
        readers: &ListNode,
        out: Option<&ListNode>,
        qs: &ListNode,
    ) -> MutexGuard<'static, ()> {
        let mut loops = 0u32;
        loop {
            let head = readers.as_ptr();
            let mut run = readers.next();
            while run != head {
                // SAFETY: list nodes are records' link fields, valid while
                // td_lock is held; `next` is captured before any unlink.
                unsafe {
                    let next = (*run).next();
                    let rec = ThreadRecord::from_link(run);
                    match (*rec).state(self.counter_word()) {
                        ReaderState::Active => {
                            ListNode::unlink(run);
                            match out {
                                Some(list) => list.insert_front(run),
                                None => qs.insert_front(run),
                            }
                        }
                        ReaderState::Inactive => {
                            ListNode::unlink(run);
                            qs.insert_front(run);
                        }
                        ReaderState::Old => {}
                    }
                    run = next;
                }
            }

            if readers.is_empty_head() {
                break;
            }

            // Old-phase readers remain; drop the lock so they can make
            // progress. The acquire fence pairs with their release store
            // in read_exit.
            drop(td);
            if loops < POLL_SPINS {
                atomic::fence(Ordering::Acquire);
                loops += 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
                loops = 0;
            }
            td = self.td_lock.lock();
        }
        td
    }

    /// Post-fork reset in the child: only the calling thread survives, so
    /// the list is rebuilt around its record (if it had one). Caches of
    /// vanished threads are lost along with their pending deltas, which is
    /// the usual fork-from-multithreaded contract.
    ///
    /// # Safety
    /// Only callable from a post-fork child hook, where no other thread
    /// exists.
    pub unsafe fn reset_after_fork(&self, rec: *mut ThreadRecord) {
        self.root.init_head();
        let mut survivors = 0;
        if !rec.is_null() {
            // SAFETY: the record belongs to the calling thread; its stale
            // parent-side links are overwritten by the insert.
            unsafe {
                if (*rec).link.is_linked() {
                    self.root.insert_front((*rec).link.as_ptr());
                    survivors = 1;
                }
            }
        }
        self.threads.store(survivors, Ordering::Relaxed);
    }

    /// Release both registry locks without a guard. Used by the fork hooks,
    /// which acquire in `prepare` and release in `parent`/`child`.
    ///
    /// # Safety
    /// Both locks must be held by the hook protocol.
    pub unsafe fn force_unlock_both(&self) {
        // SAFETY: per the function contract.
        unsafe {
            self.td_lock.force_unlock();
            self.gp_lock.force_unlock();
        }
    }

    fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            registered_threads: self.threads.load(Ordering::Relaxed),
            grace_periods: self.grace_periods.load(Ordering::Relaxed),
            emergency_insertions: self.emergencies.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing the registry's activity so far.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    /// Threads currently linked in the registry.
    pub registered_threads: usize,
    /// Grace periods completed since process start.
    pub grace_periods: u64,
    /// Objects parked on the review list by the emergency path.
    pub emergency_insertions: u64,
}

/// Snapshot of the registry counters.
pub fn stats() -> RegistryStats {
    registry().snapshot()
}
