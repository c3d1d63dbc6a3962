//! A fiber-aware mutex: [`Mutex::lock`] yields the calling fiber instead of
//! blocking its worker thread, so that other fibers on the same worker keep
//! making progress while the lock is held elsewhere.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex};

use crate::fiber::Fiber;
use crate::scheduler::{current_scheduler, Task};

#[cfg(debug_assertions)]
use std::{cell::Cell, panic::Location};

struct Latch {
    state: StdMutex<LatchState>,
}

struct LatchState {
    locked: bool,
    waiters: VecDeque<Arc<Fiber>>,
}

impl Latch {
    fn new() -> Self {
        Latch {
            state: StdMutex::new(LatchState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn try_lock(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.locked {
            false
        } else {
            s.locked = true;
            true
        }
    }

    /// Yields the calling fiber until the latch can be acquired.
    fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            let this = crate::fiber::current().expect("corort: Mutex::lock() called off-fiber");
            self.state.lock().unwrap().waiters.push_back(this);
            Fiber::yield_now();
        }
    }

    /// Releases the latch and, if a fiber was waiting, reschedules it.
    fn unlock(&self) {
        let waiter = {
            let mut s = self.state.lock().unwrap();
            s.locked = false;
            s.waiters.pop_front()
        };
        if let Some(fib) = waiter {
            if let Some(sched) = current_scheduler() {
                sched.schedule(Task::Fiber(fib), -1);
            }
        }
    }
}

/// A mutual-exclusion lock between fibers (spec §5 "locking table").
///
/// Unlike [`std::sync::Mutex`], contending for the lock yields the fiber
/// rather than parking the OS thread, so a single worker can make progress
/// on other fibers while one of them waits.
pub struct Mutex<T: ?Sized> {
    latch: Latch,
    #[cfg(debug_assertions)]
    lock_location: Cell<Option<&'static Location<'static>>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T: ?Sized> Mutex<T> {
    pub fn new(t: T) -> Mutex<T>
    where
        T: Sized,
    {
        Mutex {
            latch: Latch::new(),
            #[cfg(debug_assertions)]
            lock_location: Cell::default(),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, yielding the calling fiber until it can do so.
    ///
    /// # Panics
    /// If called off-fiber (no current fiber on this thread).
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if !self.latch.try_lock() {
            #[cfg(debug_assertions)]
            self.log_lock_location();
            self.latch.lock();
        }
        #[cfg(debug_assertions)]
        self.lock_location.set(Some(Location::caller()));
        MutexGuard { lock: self }
    }

    /// Attempts to acquire the mutex without yielding. Returns `None` if it
    /// is already held.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.latch.try_lock() {
            #[cfg(debug_assertions)]
            self.lock_location.set(Some(Location::caller()));
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }

    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[cfg(debug_assertions)]
    fn log_lock_location(&self) {
        if let Some(loc) = self.lock_location.get() {
            log::trace!("corort: mutex contended, currently held since {loc}");
        }
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(t: T) -> Self {
        Mutex::new(t)
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                d.field("data", &"<locked>");
            }
        }
        d.finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.lock_location.set(None);
        self.lock.latch.unlock();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, Task};
    use std::sync::Arc;

    #[test]
    fn contended_lock_hands_off_in_order() {
        let mutex = Arc::new(Mutex::new(0));
        let sched = Scheduler::new("mutex-test", 1, false);
        let log = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..3 {
            let mutex = Arc::clone(&mutex);
            let log = Arc::clone(&log);
            sched.schedule(
                Task::Fiber(Fiber::new(format!("locker-{i}"), move || {
                    let mut guard = mutex.lock();
                    *guard += 1;
                    log.lock().unwrap().push(i);
                })),
                -1,
            );
        }
        sched.start();
        sched.stop();
        assert_eq!(*mutex.lock(), 3);
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
