//! Thread pool + task queue: dispatches fibers/callbacks onto workers
//! (spec §4.2).
//!
//! A [`Reactor`](crate::reactor::Reactor) *has a* `Scheduler` rather than
//! inheriting from it (spec §9 "multiple inheritance ... re-express as
//! interface composition"), plugging in its own [`Hooks`] for `tickle` and
//! idle-loop behavior.

use crate::fiber::{self, Fiber, State};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

/// A unit enqueued on the scheduler: either a fiber handle or a plain
/// callable, never both (spec §3 "Task").
pub enum Task {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Fiber(fb) => write!(f, "Task::Fiber({})", fb.id()),
            Task::Callback(_) => write!(f, "Task::Callback"),
        }
    }
}

struct QueuedTask {
    task: Task,
    /// Worker id this task is pinned to, or `-1` for "any".
    pin: i32,
}

/// Outcome of one iteration of a worker's idle loop.
pub enum IdleOutcome {
    /// Keep looping (the idle fiber will yield and be resumed again).
    Continue,
    /// Terminate the idle fiber; the dispatch loop should stop this worker.
    Stop,
}

/// The hooks a `Reactor` plugs into its inner `Scheduler` (spec §4.2
/// "tickle", §4.4 "idle fiber override").
pub trait Hooks: Send + Sync {
    /// Wakes a sleeping worker. No-op in the base scheduler.
    fn tickle(&self) {}
    /// One iteration of the per-worker idle loop, run with no fiber/task
    /// context other than "this worker's queue was empty".
    fn idle_iteration(&self) -> IdleOutcome {
        IdleOutcome::Continue
    }
    /// Whether the scheduler may finish stopping right now (spec §4.4
    /// "Reactor stops only when pending events = 0, timer set is empty").
    fn can_stop(&self) -> bool {
        true
    }
}

struct NopHooks;
impl Hooks for NopHooks {}

thread_local! {
    static CB_FIBER: std::cell::RefCell<Option<Arc<Fiber>>> = const { std::cell::RefCell::new(None) };
    static IDLE_FIBER: std::cell::RefCell<Option<Arc<Fiber>>> = const { std::cell::RefCell::new(None) };
    static WORKER_ID: AtomicI32 = const { AtomicI32::new(-1) };
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Weak<Scheduler>>> = const { std::cell::RefCell::new(None) };
}

/// Returns the `Scheduler` driving the current thread's dispatch loop, if
/// any (spec §6 `current_reactor()`/"active Scheduler pointer").
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

fn set_current_scheduler(sched: &Arc<Scheduler>) {
    CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(Arc::downgrade(sched)));
}

fn worker_id() -> i32 {
    WORKER_ID.with(|w| w.load(Ordering::Relaxed))
}

fn set_worker_id(id: i32) {
    WORKER_ID.with(|w| w.store(id, Ordering::Relaxed));
}

/// Thread pool + task queue scheduler (spec §3, §4.2).
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<QueuedTask>>,
    thread_count: usize,
    use_caller: bool,
    stack_size: usize,
    stopping: AtomicBool,
    idle_thread_count: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    hooks: RwLock<Arc<dyn Hooks>>,
    /// Run once on every worker thread (pool or caller) before it enters the
    /// dispatch loop. The `Reactor` uses this to bind itself as this
    /// thread's current reactor.
    on_thread_start: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, thread_count: usize, use_caller: bool) -> Arc<Scheduler> {
        Self::with_stack_size(name, thread_count, use_caller, crate::context::DEFAULT_STACK_SIZE)
    }

    pub fn with_stack_size(
        name: impl Into<String>,
        thread_count: usize,
        use_caller: bool,
        stack_size: usize,
    ) -> Arc<Scheduler> {
        assert!(thread_count > 0, "corort: scheduler needs at least one worker");
        Arc::new(Scheduler {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            thread_count,
            use_caller,
            stack_size,
            stopping: AtomicBool::new(false),
            idle_thread_count: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            hooks: RwLock::new(Arc::new(NopHooks)),
            on_thread_start: RwLock::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_hooks(&self, hooks: Arc<dyn Hooks>) {
        *self.hooks.write().unwrap() = hooks;
    }

    pub(crate) fn set_on_thread_start<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.on_thread_start.write().unwrap() = Some(Arc::new(f));
    }

    fn run_thread_start_hook(&self) {
        if let Some(hook) = self.on_thread_start.read().unwrap().clone() {
            hook();
        }
    }

    fn hooks(&self) -> Arc<dyn Hooks> {
        self.hooks.read().unwrap().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn idle_thread_count(&self) -> usize {
        self.idle_thread_count.load(Ordering::Acquire)
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Appends a task to the queue. If the queue transitioned from empty to
    /// non-empty, wakes a sleeping worker via `tickle()` (spec §4.2).
    pub fn schedule(self: &Arc<Self>, task: Task, pin: i32) {
        let became_non_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(QueuedTask { task, pin });
            was_empty
        };
        if became_non_empty {
            self.hooks().tickle();
        }
    }

    /// Pops the first task whose pin matches `worker_id` or is unpinned. If
    /// a pinned task belonging to someone else is skipped over, the caller
    /// is told to tickle so another worker notices it (spec §4.2 step 1).
    fn pop_task(&self, this_worker: i32) -> (Option<Task>, bool) {
        let mut q = self.queue.lock().unwrap();
        let pos = q
            .iter()
            .position(|t| t.pin == -1 || t.pin == this_worker);
        let Some(pos) = pos else {
            return (None, false);
        };
        let skipped_a_pinned_task = pos > 0;
        let queued = q.remove(pos).unwrap();
        (Some(queued.task), skipped_a_pinned_task)
    }

    /// Spawns `thread_count` (minus one if `use_caller`) worker threads
    /// running the dispatch loop. Idempotent is not supported: a stopped
    /// scheduler is terminal (spec §4.2).
    pub fn start(self: &Arc<Self>) {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "corort: Scheduler::start() called twice"
        );
        let pool_threads = self.thread_count - self.use_caller as usize;
        let mut threads = self.threads.lock().unwrap();
        for i in 0..pool_threads {
            let sched = Arc::clone(self);
            let name = format!("{}-{}", self.name, i);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    set_worker_id(i as i32);
                    set_current_scheduler(&sched);
                    fiber::set_scheduler_loop_fiber(fiber::thread_primary_fiber());
                    sched.run_thread_start_hook();
                    sched.dispatch_loop(i as i32);
                })
                .expect("corort: failed to spawn worker thread");
            threads.push(handle);
        }
        debug!("corort: scheduler '{}' started with {} pool threads (caller-mode: {})", self.name, pool_threads, self.use_caller);
    }

    /// Caller-mode worker id: the last slot.
    fn caller_worker_id(&self) -> i32 {
        (self.thread_count - 1) as i32
    }

    /// Signals shutdown, wakes every worker, optionally drains the caller's
    /// own slot, then joins all pool threads (spec §4.2).
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::Release);
        // Once per worker, plus once more in caller-mode (spec §4.2).
        let tickles = self.thread_count + self.use_caller as usize;
        for _ in 0..tickles {
            self.hooks().tickle();
        }
        if self.use_caller {
            set_worker_id(self.caller_worker_id());
            set_current_scheduler(self);
            self.run_thread_start_hook();
            let sched = Arc::clone(self);
            let worker_id = self.caller_worker_id();
            let loop_fiber = Fiber::new_scheduler_loop(
                format!("{}-caller-loop", self.name),
                self.stack_size,
                move || sched.dispatch_loop(worker_id),
            );
            fiber::set_scheduler_loop_fiber(Arc::clone(&loop_fiber));
            loop_fiber.resume();
            assert_eq!(loop_fiber.state(), State::Term);
        }
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
        debug!("corort: scheduler '{}' stopped", self.name);
    }

    /// Runs `cb` on this worker's reusable "cb fiber" (spec §4.2 step 3):
    /// reset it if one already exists (it must be TERM between uses),
    /// otherwise create it bound to `cb` directly.
    fn run_callback(cb: Box<dyn FnOnce() + Send + 'static>, stack_size: usize) {
        let existing = CB_FIBER.with(|c| c.borrow().clone());
        let fib = match existing {
            Some(fib) => {
                assert_eq!(
                    fib.state(),
                    State::Term,
                    "corort: cb-fiber reused while not TERM (programming error)"
                );
                fib.reset(cb);
                fib
            }
            None => {
                let fib = Fiber::with_stack_size("cb-fiber", stack_size, cb);
                CB_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(&fib)));
                fib
            }
        };
        fib.resume();
    }

    fn get_or_create_idle_fiber(hooks: Arc<dyn Hooks>, stack_size: usize) -> Arc<Fiber> {
        IDLE_FIBER.with(|c| {
            if let Some(fib) = c.borrow().clone() {
                return fib;
            }
            let fib = Fiber::with_stack_size("idle-fiber", stack_size, move || loop {
                match hooks.idle_iteration() {
                    IdleOutcome::Continue => Fiber::yield_now(),
                    IdleOutcome::Stop => return,
                }
            });
            *c.borrow_mut() = Some(Arc::clone(&fib));
            fib
        })
    }

    /// The dispatch loop run by every worker, pool or caller (spec §4.2).
    fn dispatch_loop(self: Arc<Self>, this_worker: i32) {
        trace!("corort: worker {this_worker} entering dispatch loop");
        loop {
            if self.is_stopping() && self.queue_is_empty() && self.hooks().can_stop() {
                break;
            }

            let (popped, skipped_pinned) = self.pop_task(this_worker);
            if skipped_pinned {
                self.hooks().tickle();
            }

            match popped {
                Some(Task::Fiber(fib)) => {
                    fib.resume();
                    // READY => it yielded voluntarily and whoever woke it
                    // (typically the Reactor) has already re-enqueued it.
                    // TERM => it ran to completion; nothing further to do.
                }
                Some(Task::Callback(cb)) => {
                    Self::run_callback(cb, self.stack_size);
                }
                None => {
                    self.idle_thread_count.fetch_add(1, Ordering::AcqRel);
                    let idle = Self::get_or_create_idle_fiber(self.hooks(), self.stack_size);
                    if idle.state() == State::Term {
                        self.idle_thread_count.fetch_sub(1, Ordering::AcqRel);
                        break;
                    }
                    idle.resume();
                    self.idle_thread_count.fetch_sub(1, Ordering::AcqRel);
                    if idle.state() == State::Term {
                        break;
                    }
                }
            }
        }
        trace!("corort: worker {this_worker} leaving dispatch loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spawn_and_join_ten_fibers() {
        let sched = Scheduler::new("test", 1, false);
        let results = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let results = Arc::clone(&results);
            sched.schedule(
                Task::Callback(Box::new(move || {
                    results.lock().unwrap().push(i);
                })),
                -1,
            );
        }
        sched.start();
        sched.stop();
        assert_eq!(*results.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn pinned_task_runs_on_its_worker() {
        let sched = Scheduler::new("test", 2, false);
        let seen = Arc::new(AtomicUsize::new(99));
        {
            let seen = Arc::clone(&seen);
            sched.schedule(
                Task::Callback(Box::new(move || {
                    seen.store(worker_id() as usize, Ordering::SeqCst);
                })),
                1,
            );
        }
        sched.start();
        sched.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
