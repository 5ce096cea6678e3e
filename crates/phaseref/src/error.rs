//! Library error types

use thiserror::Error;

/// Errors reported by the public API.
///
/// Misuse that cannot be reported this way (unbalanced enter/exit, a
/// reference count going negative, delta-table overflow) is a programmer
/// error and panics instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The calling thread is inside a read critical section, so its caches
    /// cannot be flushed right now. The flush is deferred to the matching
    /// `read_exit`.
    #[error("read critical section active; flush deferred to read_exit")]
    ReadSectionActive,

    /// The process-exit hook could not be registered with the host.
    #[error("process-exit hook registration failed")]
    ExitHandler,

    /// The fork hooks could not be registered with the host.
    #[error("fork hook registration failed")]
    ForkHandler,
}
