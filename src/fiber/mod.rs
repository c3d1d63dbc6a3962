//! A stackful coroutine with states `{READY, RUNNING, TERM}` and a
//! non-preemptive resume/yield protocol (spec §3, §4.1).
//!
//! A [`Fiber`] is shared between the scheduler's task queue, a reactor event
//! slot, and any user-held handle concurrently (spec §9 "shared ownership of
//! fibers"); we model that as `Arc<Fiber>`. Only the fiber's own worker
//! thread ever mutates its state or resumes it, so no internal locking
//! beyond the `Arc` refcount is required — the scheduler's dispatch
//! discipline is what makes that true, not the type system, hence the
//! `unsafe impl Send + Sync` below.

pub mod channel;
pub mod cond;
pub mod csw;
pub mod mutex;

pub use cond::Cond;
pub use csw::{check_yield, csw, YieldResult};
pub use mutex::{Mutex, MutexGuard};

use crate::context::{Context, DEFAULT_STACK_SIZE};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A fiber's lifecycle state (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Running,
    Term,
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// A stackful coroutine.
pub struct Fiber {
    id: u64,
    ctx: Context,
    state: Cell<State>,
    entry: RefCell<Option<Entry>>,
    /// Number of times this fiber has been resumed, exposed via [`csw::csw`]
    /// for tests that assert on yield behavior.
    csw: AtomicU64,
    /// Fibers launched directly by a user (bypassing the scheduler) or the
    /// scheduler-loop fiber itself are not schedulable: yielding from them
    /// returns to the thread-primary fiber, not the scheduler loop
    /// (spec §4.1).
    schedulable: bool,
    name: RefCell<Option<String>>,
}

// Safety: a `Fiber` is resumed/mutated by exactly one worker thread at a
// time by construction of the scheduler's dispatch loop; it may be handed
// off to a different thread only while fully parked (never mid-resume).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("schedulable", &self.schedulable)
            .finish()
    }
}

fn next_fiber_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    /// The fiber currently RUNNING on this thread, if any.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// This worker's thread-primary fiber: owns the native OS stack, created
    /// lazily, never destroyed while the thread lives.
    static THREAD_PRIMARY: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The fiber running this worker's dispatch loop. On pool workers this
    /// coincides with the thread-primary fiber; on a caller-mode scheduler's
    /// calling thread it is a distinct fiber created explicitly.
    static SCHEDULER_LOOP: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Constructs a brand-new, unstarted, schedulable fiber with the default
    /// stack size (spec §3: 128 KiB).
    pub fn new<F>(name: impl Into<String>, f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(name, DEFAULT_STACK_SIZE, f)
    }

    pub fn with_stack_size<F>(
        name: impl Into<String>,
        stack_size: usize,
        f: F,
    ) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Some(name.into()), stack_size, f, true)
    }

    /// Like [`Fiber::new`], but marks the fiber unschedulable: its final
    /// yield (on termination) targets the thread-primary fiber rather than
    /// the scheduler-loop fiber. Used for the caller-mode scheduler-loop
    /// fiber itself, which *is* the scheduler loop and must not try to swap
    /// into itself when its entry returns.
    pub(crate) fn new_scheduler_loop<F>(
        name: impl Into<String>,
        stack_size: usize,
        f: F,
    ) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Some(name.into()), stack_size, f, false)
    }

    fn build<F>(
        name: Option<String>,
        stack_size: usize,
        f: F,
        schedulable: bool,
    ) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Arc::new(Fiber {
            id: next_fiber_id(),
            ctx: Context::new(stack_size, trampoline, 0),
            state: Cell::new(State::Ready),
            entry: RefCell::new(Some(Box::new(f))),
            csw: AtomicU64::new(0),
            schedulable,
            name: RefCell::new(name),
        });
        // The trampoline needs to recover `self` without a real argument
        // channel (the context primitive only carries a `usize`); rather
        // than stash a raw pointer in the stack we thread it through
        // `CURRENT`, which `resume` sets before the first swap anyway.
        fiber
    }

    /// Constructs the special unscheduled fiber that owns a worker's native
    /// stack (thread-primary) or runs its dispatch loop (scheduler-loop).
    /// Such fibers are never handed to `Scheduler::schedule`.
    fn new_unscheduled(name: &'static str) -> Arc<Fiber> {
        Arc::new(Fiber {
            id: next_fiber_id(),
            // This fiber never itself gets `resume`d into a fresh stack: it
            // represents control already executing on the native stack.
            ctx: Context::new(16 * 1024, unreachable_trampoline, 0),
            state: Cell::new(State::Running),
            entry: RefCell::new(None),
            csw: AtomicU64::new(0),
            schedulable: false,
            name: RefCell::new(Some(name.to_string())),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn is_schedulable(&self) -> bool {
        self.schedulable
    }

    /// Number of times this fiber has been resumed so far (spec §8 "testable
    /// properties": used by tests to assert that an operation did or didn't
    /// yield).
    pub fn csw(&self) -> u64 {
        self.csw.load(Ordering::Relaxed)
    }

    /// Resumes this fiber: the calling fiber becomes suspended and this one
    /// becomes RUNNING (spec §4.1 "resume contract").
    ///
    /// # Panics
    /// If `self` is not READY, or the calling thread has no current fiber.
    pub fn resume(self: &Arc<Fiber>) {
        assert_eq!(
            self.state.get(),
            State::Ready,
            "corort: resuming a fiber that is not READY (programming error)"
        );
        let caller = current().expect("corort: resume() called off-fiber");
        self.state.set(State::Running);
        self.csw.fetch_add(1, Ordering::Relaxed);
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(self)));
        // Safety: `caller` is the context currently executing; `self.ctx` is
        // either freshly initialized or parked by a previous yield. Neither
        // is resumed concurrently because the scheduler never hands the same
        // fiber to two workers at once.
        unsafe {
            caller.ctx.swap(&self.ctx);
        }
    }

    /// Yields control back to the appropriate return target (spec §4.1
    /// "yield contract"): the scheduler-loop fiber if this fiber is
    /// schedulable, otherwise the thread-primary fiber. This distinction
    /// resolves spec §9 open question (a): the swap target is chosen
    /// unconditionally by `schedulable`, never by a success/failure branch.
    pub fn yield_now() {
        let this = current().expect("corort: yield_now() called off-fiber");
        assert_eq!(
            this.state.get(),
            State::Running,
            "corort: yielding a fiber that is not RUNNING"
        );
        this.state.set(State::Ready);
        Self::switch_out(&this);
    }

    /// Used by the entry trampoline once the callable completes: marks TERM
    /// before the final, never-returning yield.
    fn terminate_and_switch_out(this: &Arc<Fiber>) -> ! {
        this.state.set(State::Term);
        Self::switch_out(this);
        unreachable!("corort: a TERM fiber was resumed back into its own trampoline");
    }

    fn switch_out(this: &Arc<Fiber>) {
        let target = if this.schedulable {
            scheduler_loop_fiber()
        } else {
            thread_primary_fiber()
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&target)));
        // Safety: see `resume`.
        unsafe {
            this.ctx.swap(&target.ctx);
        }
    }

    /// Resets a TERM fiber for reuse with a new entry callable, reusing its
    /// stack allocation (spec §4.1 "Reset").
    ///
    /// # Panics
    /// If `self` is not TERM.
    pub fn reset<F>(self: &Arc<Fiber>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(
            self.state.get(),
            State::Term,
            "corort: resetting a fiber that is not TERM (programming error)"
        );
        *self.entry.borrow_mut() = Some(Box::new(f));
        self.ctx.reset(trampoline, 0);
        self.state.set(State::Ready);
    }
}

/// The entry trampoline (spec §4.1): runs the entry callable, marks TERM,
/// releases the callable, and yields one final time. Must never return past
/// that yield — if it did, execution would run off the end of the fiber's
/// private stack.
extern "C" fn trampoline(_arg: usize) -> ! {
    let this = current().expect("corort: fiber trampoline entered with no current fiber set");
    let entry = this
        .entry
        .borrow_mut()
        .take()
        .expect("corort: fiber trampoline entered twice");
    entry();
    Fiber::terminate_and_switch_out(&this)
}

extern "C" fn unreachable_trampoline(_arg: usize) -> ! {
    unreachable!("corort: an unscheduled (thread-primary/scheduler-loop) fiber's stack was entered")
}

/// Returns the fiber currently RUNNING on this thread, lazily creating the
/// thread-primary fiber if none has run yet (spec §6 `current_fiber()`).
pub fn current() -> Option<Arc<Fiber>> {
    let existing = CURRENT.with(|c| c.borrow().clone());
    if existing.is_some() {
        return existing;
    }
    let primary = thread_primary_fiber();
    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&primary)));
    Some(primary)
}

pub(crate) fn thread_primary_fiber() -> Arc<Fiber> {
    THREAD_PRIMARY.with(|p| {
        let mut p = p.borrow_mut();
        if p.is_none() {
            *p = Some(Fiber::new_unscheduled("thread-primary"));
        }
        Arc::clone(p.as_ref().unwrap())
    })
}

pub(crate) fn scheduler_loop_fiber() -> Arc<Fiber> {
    SCHEDULER_LOOP.with(|p| {
        let mut p = p.borrow_mut();
        if p.is_none() {
            *p = Some(Fiber::new_unscheduled("scheduler-loop"));
        }
        Arc::clone(p.as_ref().unwrap())
    })
}

/// Installs `fiber` as this thread's scheduler-loop fiber. Called once by a
/// pool worker (where it coincides with the thread-primary fiber) and once
/// explicitly by a caller-mode `Scheduler` on its constructing thread.
pub(crate) fn set_scheduler_loop_fiber(fiber: Arc<Fiber>) {
    SCHEDULER_LOOP.with(|p| *p.borrow_mut() = Some(fiber));
}

/// Suspends the current fiber via an `add_timer` + yield, the canonical
/// hooked-sleep pattern of spec §6. Requires a reactor to be current on this
/// thread; panics otherwise, same as the hook layer would.
pub fn sleep(duration: Duration) {
    use crate::reactor::current_reactor;
    let reactor = current_reactor().expect("corort: fiber::sleep() requires a current reactor");
    let fiber = current().expect("corort: fiber::sleep() called off-fiber");
    let ms = duration.as_millis() as u64;
    reactor.timers().add_timer(
        ms,
        {
            let reactor = Arc::downgrade(&reactor);
            move || {
                if let Some(reactor) = reactor.upgrade() {
                    reactor.scheduler().schedule(crate::scheduler::Task::Fiber(fiber.clone()), -1);
                }
            }
        },
        false,
    );
    Fiber::yield_now();
}
