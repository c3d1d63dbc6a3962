//! Platform-failure error types (spec §7).
//!
//! Programming errors (misuse of the fiber/scheduler API, broken invariants)
//! are not represented here: they `assert!`/`unreachable!`/abort, per spec
//! §7 "programming errors are not recoverable". Only failures that originate
//! outside this process's control — a syscall the kernel refused, a
//! deadline that passed — are modeled as a `Result`.

use std::io;
use thiserror::Error;

/// Errors that can flow out of the reactor/hook layer (spec §4.4, §6).
#[derive(Debug, Error)]
pub enum Error {
    /// The readiness notifier (epoll) rejected a registration, modification,
    /// or deregistration.
    #[error("notifier {op} failed for fd {fd}: {source}")]
    Notifier {
        op: &'static str,
        fd: i32,
        #[source]
        source: io::Error,
    },

    /// A blocking operation hit its deadline before becoming ready.
    #[error("operation timed out")]
    Timeout,

    /// The fiber or file descriptor was cancelled before the operation
    /// completed (spec §7 "cancellation").
    #[error("operation was cancelled")]
    Cancelled,

    /// A raw syscall failure not otherwise classified above.
    #[error("{0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
