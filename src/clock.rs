//! Time sources used throughout the crate.
//!
//! Mirrors the POSIX `clock_gettime` clock IDs: wall-clock time (affected by
//! NTP/user adjustment) and monotonic time (never steps backward under
//! normal operation; see [`crate::timer`]'s clock-skew detection for what
//! happens when it does anyway).
//!
//! - [`time`]/[`time64`] - wall clock seconds/nanoseconds since epoch
//! - [`monotonic`]/[`monotonic64`] - monotonic seconds/nanoseconds since an
//!   unspecified but fixed point in the past
//! - [`process`]/[`process64`] - CPU time consumed by the whole process
//! - [`thread`]/[`thread64`] - CPU time consumed by the calling thread

use std::time::Duration;

pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn clock_gettime_ns(clock_id: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: `ts` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    assert_eq!(rc, 0, "corort: clock_gettime failed (programming error)");
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall clock seconds since the epoch (1970-01-01 00:00:00 UTC), subject to
/// NTP and manual adjustment. Not monotonic; do not use for measuring
/// elapsed durations.
#[inline]
pub fn time() -> f64 {
    time64() as f64 / 1e9
}

/// See [`time`].
#[inline]
pub fn time64() -> u64 {
    clock_gettime_ns(libc::CLOCK_REALTIME)
}

/// Monotonic seconds since an unspecified fixed point. Never decreases under
/// normal operation; the best choice for measuring elapsed time.
#[inline]
pub fn monotonic() -> f64 {
    monotonic64() as f64 / 1e9
}

/// See [`monotonic`].
#[inline]
pub fn monotonic64() -> u64 {
    clock_gettime_ns(libc::CLOCK_MONOTONIC)
}

/// CPU time consumed by this process since it started, in seconds.
#[inline]
pub fn process() -> f64 {
    process64() as f64 / 1e9
}

/// See [`process`].
#[inline]
pub fn process64() -> u64 {
    clock_gettime_ns(libc::CLOCK_PROCESS_CPUTIME_ID)
}

/// CPU time consumed by the calling thread since it started, in seconds.
#[inline]
pub fn thread() -> f64 {
    thread64() as f64 / 1e9
}

/// See [`thread`].
#[inline]
pub fn thread64() -> u64 {
    clock_gettime_ns(libc::CLOCK_THREAD_CPUTIME_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backward() {
        let a = monotonic64();
        std::thread::sleep(Duration::from_millis(1));
        let b = monotonic64();
        assert!(b >= a);
    }

    #[test]
    fn time_is_plausible() {
        // Any timestamp after 2020-01-01.
        assert!(time64() > 1_577_836_800_000_000_000);
    }
}
