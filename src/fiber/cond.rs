//! A fiber-aware condition variable.
//!
//! Unlike `pthread_cond_t`, [`Cond`] does not require an associated mutex:
//! `wait`/`signal`/`broadcast` only ever touch the waiter queue, which is
//! itself synchronized. Grounded in the teacher's `fiber::Cond` (built on
//! Tarantool's `fiber_cond_*` C API); here the same interface is built
//! directly on [`Fiber::yield_now`] and [`Scheduler::schedule`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::fiber::Fiber;
use crate::reactor::current_reactor;
use crate::scheduler::{current_scheduler, Task};

struct Waiter {
    fiber: Arc<Fiber>,
    /// Set by whichever of {signal/broadcast, timeout} wins the race to wake
    /// this waiter; the loser is a no-op.
    claimed: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
}

/// A condition variable fibers can wait on and be woken from by `signal`
/// (wakes one) or `broadcast` (wakes all).
pub struct Cond {
    waiters: StdMutex<VecDeque<Waiter>>,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    /// Suspends the calling fiber until [`signal`](Self::signal) or
    /// [`broadcast`](Self::broadcast) wakes it. As with `pthread_cond_wait`,
    /// spurious wakeups are possible if a caller is racing a cancellation
    /// path elsewhere; callers should re-check their predicate in a loop.
    pub fn wait(&self) {
        self.wait_timeout(None);
    }

    /// Like [`wait`](Self::wait), but gives up and returns `false` after
    /// `timeout` if no signal arrived. Requires a reactor on the current
    /// thread to arm the timeout, same as [`crate::fiber::sleep`].
    ///
    /// Returns `true` if woken by a signal, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        let this = crate::fiber::current().expect("corort: Cond::wait() called off-fiber");
        let claimed = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        self.waiters.lock().unwrap().push_back(Waiter {
            fiber: Arc::clone(&this),
            claimed: Arc::clone(&claimed),
            timed_out: Arc::clone(&timed_out),
        });

        let timer = timeout.map(|d| {
            let reactor = current_reactor()
                .expect("corort: Cond::wait_timeout() with a timeout requires a current reactor");
            let claimed = Arc::clone(&claimed);
            let timed_out = Arc::clone(&timed_out);
            let fiber = Arc::clone(&this);
            let id = reactor.timers().add_timer(
                d.as_millis() as u64,
                move || {
                    if claimed
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        timed_out.store(true, Ordering::SeqCst);
                        if let Some(sched) = current_scheduler() {
                            sched.schedule(Task::Fiber(Arc::clone(&fiber)), -1);
                        }
                    }
                },
                false,
            );
            (reactor, id)
        });

        Fiber::yield_now();

        if let Some((reactor, id)) = timer {
            reactor.timers().cancel(id);
        }
        !timed_out.load(Ordering::SeqCst)
    }

    /// Wakes one waiting fiber, if any. Does not yield.
    pub fn signal(&self) {
        loop {
            let waiter = self.waiters.lock().unwrap().pop_front();
            let Some(waiter) = waiter else { return };
            if waiter
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(sched) = current_scheduler() {
                    sched.schedule(Task::Fiber(waiter.fiber), -1);
                }
                return;
            }
            // This waiter's wait already timed out; try the next one.
        }
    }

    /// Wakes every waiting fiber. Does not yield.
    pub fn broadcast(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        for waiter in waiters {
            if waiter
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(sched) = current_scheduler() {
                    sched.schedule(Task::Fiber(waiter.fiber), -1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn signal_wakes_a_single_waiter() {
        let cond = Arc::new(Cond::new());
        let sched = Scheduler::new("cond-test", 2, false);
        let woken = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let cond = Arc::clone(&cond);
            let woken = Arc::clone(&woken);
            sched.schedule(
                Task::Fiber(Fiber::new("waiter", move || {
                    cond.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })),
                -1,
            );
        }
        sched.start();
        std::thread::sleep(Duration::from_millis(20));
        cond.signal();
        cond.signal();
        cond.signal();
        sched.stop();
        assert_eq!(woken.load(Ordering::SeqCst), 3);
    }
}
