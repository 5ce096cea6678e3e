//! Per-thread delta tables.
//!
//! A delta table is a small fixed-capacity open-addressed map from object
//! address to an accumulated reference-count change. Threads fill tables
//! during read critical sections; the grace-period engine drains them in
//! bulk, so a single atomic-free slot write replaces a per-access
//! read-modify-write on the shared count.

use crate::object::RefHeader;
use std::ptr;

/// Capacity of each delta table. Must be a power of two; raise it at build
/// time for workloads that touch many distinct objects per grace period.
pub const N_DELTAS: usize = 128;

const _: () = assert!(N_DELTAS.is_power_of_two());

/// Load-factor percentage at which an insert signals "near full".
const NEAR_FULL_PCT: usize = 75;

#[derive(Clone, Copy)]
pub(crate) struct Delta {
    pub ptr: *mut RefHeader,
    pub delta: isize,
}

impl Delta {
    const EMPTY: Delta = Delta {
        ptr: ptr::null_mut(),
        delta: 0,
    };
}

/// Result of a single [`DeltaTable::add`].
#[derive(Clone, Copy)]
pub(crate) struct AddOutcome {
    /// Slot index the delta landed in.
    pub slot: usize,
    /// Whether a fresh slot was consumed (false: merged into an existing
    /// entry for the same address).
    pub inserted: bool,
    /// Whether the table is at or above the near-full watermark after this
    /// insert. Merges never signal.
    pub near_full: bool,
}

/// Open-addressed address → delta map.
///
/// Probing starts at `(addr >> 3) mod N` and steps by an incrementing
/// probe count. Tables are drained to empty between grace periods, so no
/// tombstones are needed; the emergency path may punch one hole in a chain,
/// which is tolerable because the table is flushed almost immediately
/// afterwards.
pub(crate) struct DeltaTable {
    slots: [Delta; N_DELTAS],
    n_used: usize,
}

impl DeltaTable {
    pub const fn new() -> Self {
        Self {
            slots: [Delta::EMPTY; N_DELTAS],
            n_used: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_used == 0
    }

    /// Record `delta` for `ptr`, merging with any pending delta for the
    /// same address.
    ///
    /// Never called on a full table: callers flush before that can happen.
    #[inline]
    pub fn add(&mut self, ptr: *mut RefHeader, delta: isize) -> AddOutcome {
        assert!(self.n_used < N_DELTAS, "delta table overflow");

        let mut idx = (ptr as usize >> 3) & (N_DELTAS - 1);
        let mut probe = 1usize;
        loop {
            let slot = &mut self.slots[idx];
            if slot.ptr.is_null() {
                slot.ptr = ptr;
                slot.delta = delta;
                self.n_used += 1;
                return AddOutcome {
                    slot: idx,
                    inserted: true,
                    near_full: self.n_used * 100 >= N_DELTAS * NEAR_FULL_PCT,
                };
            } else if slot.ptr == ptr {
                slot.delta += delta;
                return AddOutcome {
                    slot: idx,
                    inserted: false,
                    near_full: false,
                };
            }

            idx = (idx + probe) & (N_DELTAS - 1);
            probe += 1;
        }
    }

    /// Move entries from `src` into `self`, stopping early if `self`
    /// crosses the near-full watermark. Anything left behind is picked up
    /// on the next grace period.
    pub fn merge(&mut self, src: &mut DeltaTable) {
        for i in 0..N_DELTAS {
            if src.n_used == 0 {
                break;
            }
            let entry = src.slots[i];
            if entry.ptr.is_null() {
                continue;
            }

            let out = self.add(entry.ptr, entry.delta);
            src.slots[i] = Delta::EMPTY;
            src.n_used -= 1;
            if out.near_full {
                break;
            }
        }
    }

    /// Remove and return the entry at `slot`. Used by the emergency path
    /// to back out the delta it just recorded.
    pub fn remove_slot(&mut self, slot: usize) -> Delta {
        let entry = self.slots[slot];
        assert!(!entry.ptr.is_null(), "removing an empty delta slot");
        self.slots[slot] = Delta::EMPTY;
        self.n_used -= 1;
        entry
    }

    /// Apply every pending delta to its object's reference count and clear
    /// the table. When `dec` is set, an object whose count reaches zero is
    /// finalized.
    ///
    /// # Safety
    /// Every non-empty slot must point to a live header, and the caller
    /// must hold the serialization the headers' count requires (the
    /// grace-period engine holds the thread-list lock throughout).
    pub unsafe fn drain(&mut self, dec: bool) {
        for i in 0..N_DELTAS {
            if self.n_used == 0 {
                break;
            }
            let entry = self.slots[i];
            if entry.ptr.is_null() {
                continue;
            }

            // SAFETY: per the function contract the header is live and the
            // count access is serialized.
            unsafe {
                let header = &*entry.ptr;
                let refcnt = header.refcnt.get() + entry.delta;
                header.refcnt.set(refcnt);
                assert!(refcnt >= 0, "reference count went negative");
                if dec && refcnt == 0 {
                    if let Some(fini) = header.fini.get() {
                        // The finalizer frees the object; `entry` is a copy
                        // so the slot clear below never touches it again.
                        fini(entry.ptr);
                    }
                }
            }

            self.slots[i] = Delta::EMPTY;
            self.n_used -= 1;
        }
    }
}
