//! Context-switch tracking, mostly useful for tests.

use super::current;

/// Returns the number of times the calling fiber has been resumed so far.
pub fn csw() -> u64 {
    current()
        .expect("corort: csw() called off-fiber")
        .csw()
}

/// Calls `f` and reports whether it caused the calling fiber to yield at
/// least once.
///
/// # Example
/// ```no_run
/// # use corort::fiber::check_yield;
/// # use corort::fiber::YieldResult::*;
/// # use std::time::Duration;
/// assert_eq!(check_yield(|| ()), DidntYield(()));
/// ```
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let before = csw();
    let res = f();
    if csw() == before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Outcome of [`check_yield`].
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    DidntYield(T),
    Yielded(T),
}
