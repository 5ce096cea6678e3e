//! Managed object header and composition helpers.
//!
//! Every managed object embeds a [`RefHeader`] as its first field. The
//! header carries the object's reference count, the finalizer invoked when
//! the count first reaches zero, and the link used while the object is
//! parked on the registry's review list.

use std::cell::Cell;
use std::ptr;

/// Finalizer invoked exactly once when an object's reference count first
/// reaches zero during grace-period application.
///
/// Receives a pointer to the object's [`RefHeader`]. Because the header is
/// the first field of a `#[repr(C)]` object, this pointer is also the
/// object pointer; the finalizer is expected to reclaim the storage.
///
/// A finalizer must not call back into this library.
pub type FinalizeFn = unsafe fn(*mut RefHeader);

/// Header embedded as the first field of every managed object.
///
/// The fields are plain cells rather than atomics: `refcnt` is written only
/// by the grace-period engine (which holds the registry's thread-list lock
/// throughout application) or by the emergency path (under the same lock),
/// and `review_next` is read and written only under that lock. `fini` is
/// written during `init`, when the caller has exclusive access.
#[repr(C)]
pub struct RefHeader {
    pub(crate) refcnt: Cell<isize>,
    pub(crate) fini: Cell<Option<FinalizeFn>>,
    pub(crate) review_next: Cell<*mut RefHeader>,
}

// SAFETY: all mutation of the cells is serialized by the registry protocol
// described above; readers never touch them directly.
unsafe impl Send for RefHeader {}
unsafe impl Sync for RefHeader {}

impl RefHeader {
    /// Create a header with a reference count of one.
    pub const fn new(fini: Option<FinalizeFn>) -> Self {
        Self {
            refcnt: Cell::new(1),
            fini: Cell::new(fini),
            review_next: Cell::new(ptr::null_mut()),
        }
    }

    /// Reinitialize the header: count back to one, finalizer installed,
    /// review link cleared. The caller must have exclusive access to the
    /// object (nothing may hold a batched reference to it).
    pub fn init(&self, fini: Option<FinalizeFn>) {
        self.refcnt.set(1);
        self.fini.set(fini);
        self.review_next.set(ptr::null_mut());
    }

    /// Current reference count.
    ///
    /// Only meaningful when no grace period is applying deltas and no
    /// thread holds pending deltas for this object, e.g. in tests after a
    /// completed [`flush`](crate::flush).
    pub fn refcount(&self) -> isize {
        self.refcnt.get()
    }

    /// Raw pointer to this header, e.g. for [`finalize`].
    #[inline]
    pub fn as_ptr(&self) -> *mut RefHeader {
        self as *const RefHeader as *mut RefHeader
    }
}

/// Force-invoke an object's finalizer, regardless of its reference count.
///
/// # Safety
/// `header` must point to a live initialized header, and no batched
/// reference to the object may be pending anywhere.
pub unsafe fn finalize(header: *mut RefHeader) {
    // SAFETY: caller guarantees the header is live.
    if let Some(fini) = unsafe { (*header).fini.get() } {
        // SAFETY: the finalizer contract is the caller's.
        unsafe { fini(header) };
    }
}

/// Marker capability for managed objects: anything that can hand out its
/// embedded [`RefHeader`].
pub trait Refcounted {
    /// The embedded header.
    fn header(&self) -> &RefHeader;
}

/// Heap-allocated composition of a [`RefHeader`] and a user payload.
///
/// The header is the first field and the struct is `#[repr(C)]`, so a
/// pointer to the allocation and a pointer to its header are
/// interchangeable. [`Counted::new`] installs a finalizer that drops the
/// box, so the payload's `Drop` runs when the count reaches zero.
#[repr(C)]
pub struct Counted<T> {
    header: RefHeader,
    value: T,
}

impl<T> Counted<T> {
    /// Allocate a managed value with a reference count of one.
    ///
    /// Ownership of the allocation passes to the reference-counting
    /// machinery; it is reclaimed by the installed finalizer.
    pub fn new(value: T) -> *mut Counted<T> {
        Box::into_raw(Box::new(Counted {
            header: RefHeader::new(Some(Self::finalize_boxed)),
            value,
        }))
    }

    /// The user payload.
    pub fn value(&self) -> &T {
        &self.value
    }

    unsafe fn finalize_boxed(header: *mut RefHeader) {
        // SAFETY: the header was created by `Counted::new`, so it is the
        // first field of a boxed `Counted<T>` and the cast recovers the
        // original allocation.
        drop(unsafe { Box::from_raw(header as *mut Counted<T>) });
    }
}

impl<T> Refcounted for Counted<T> {
    fn header(&self) -> &RefHeader {
        &self.header
    }
}
