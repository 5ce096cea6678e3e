//! # Phaseref
//!
//! Scalable, thread-safe reference counting for shared, mutable pointer
//! slots. Readers dereference managed objects inside cheap critical
//! sections and batch their +1/-1 reference-count changes in per-thread
//! caches; a grace-period protocol applies the batches in bulk once no
//! reader can still be looking at the affected phase. Destruction is
//! deferred until it is provably safe.
//!
//! ## Design
//!
//! - **Phase-split caches**: every thread keeps two pairs of increment and
//!   decrement tables, selected by a one-bit global phase. The phase in
//!   use is being filled; the opposite one is drained by grace periods.
//! - **Two-pass grace periods**: the engine classifies every registered
//!   reader, flips the phase, waits for stragglers, then applies all
//!   increments before all decrements and finalizes whatever reached
//!   zero.
//! - **Emergency review list**: a thread whose cache fills up inside a
//!   read section applies the delta directly under the registry lock and
//!   parks the object for the next grace period to finalize or unpark.
//! - Users perform their own atomic pointer swaps on slots holding
//!   managed objects; this crate only tracks lifetimes.
//!
//! ```
//! use phaseref::{Counted, flush, read, release};
//!
//! let slot = Counted::new(42u32);
//! {
//!     let guard = read();
//!     // SAFETY: `slot` is live and the acquire is balanced below.
//!     let p = unsafe { guard.acquire(slot) };
//!     assert_eq!(*unsafe { &*p }.value(), 42);
//!     unsafe { guard.release(p) };
//! }
//! // Drop the initial reference and reclaim.
//! unsafe { release(slot) };
//! flush().expect("not inside a read section");
//! ```

mod delta;
mod error;
mod fork;
mod list;
mod object;
mod read;
mod registry;
mod thread;

pub use delta::N_DELTAS;
pub use error::Error;
#[cfg(unix)]
pub use fork::install_fork_hooks;
pub use fork::{ForkHooks, fork_hooks};
pub use object::{Counted, FinalizeFn, RefHeader, Refcounted, finalize};
pub use read::{ReadGuard, acquire, flush, read, read_enter, read_exit, release};
pub use registry::{RegistryStats, stats};

use std::sync::Once;
use std::sync::atomic::{AtomicI32, Ordering};

static EXIT_HOOK: Once = Once::new();
static EXIT_HOOK_STATUS: AtomicI32 = AtomicI32::new(0);

/// Initialize the library. Idempotent.
///
/// The registry itself is lazily constructed, so calling this is optional
/// on platforms whose thread-local destructors also run for the main
/// thread. What `init` adds is a process-exit hook that drains the calling
/// thread's caches even where those destructors do not run, mirroring what
/// thread exit does for every other thread.
pub fn init() -> Result<(), Error> {
    #[cfg(unix)]
    {
        extern "C" fn exit_flush() {
            crate::thread::teardown_current();
        }

        EXIT_HOOK.call_once(|| {
            // SAFETY: registering a static extern "C" callback.
            let rc = unsafe { libc::atexit(exit_flush) };
            EXIT_HOOK_STATUS.store(rc, Ordering::Release);
        });
        if EXIT_HOOK_STATUS.load(Ordering::Acquire) != 0 {
            return Err(Error::ExitHandler);
        }
    }
    #[cfg(not(unix))]
    {
        EXIT_HOOK.call_once(|| EXIT_HOOK_STATUS.store(0, Ordering::Release));
    }
    Ok(())
}

/// The crate's (major, minor) version.
pub fn version() -> (u32, u32) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert_eq!(init(), Ok(()));
        assert_eq!(init(), Ok(()));
    }

    #[test]
    fn test_version_matches_manifest() {
        let (major, minor) = version();
        assert_eq!(major.to_string(), env!("CARGO_PKG_VERSION_MAJOR"));
        assert_eq!(minor.to_string(), env!("CARGO_PKG_VERSION_MINOR"));
    }
}
