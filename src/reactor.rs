//! I/O reactor: composes a [`Scheduler`] and a [`TimerManager`] with an
//! epoll-based readiness notifier (spec §4.4).
//!
//! The original source multiply-inherits from both Scheduler and
//! TimerManager; here the Reactor *has a* Scheduler and *has a* TimerManager
//! instead, installing itself as the [`Hooks`] implementation of the former
//! and the insertion-at-front callback of the latter (spec §9 "re-express as
//! interface composition").

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::scheduler::{current_scheduler, Hooks, IdleOutcome, Scheduler, Task};
use crate::timer::{now_ms, TimerId, TimerManager};
use log::{error, trace, warn};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// READ/WRITE interest bits (spec §3 "FdState"). Plain bit flags rather than
/// a `bitflags!`-generated type: the reactor only ever needs set/test/clear,
/// never a full flag algebra.
pub const READ: u32 = 0b01;
pub const WRITE: u32 = 0b10;

/// What an event slot does when its direction becomes ready.
enum SlotAction {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct EventSlot {
    action: SlotAction,
    /// The scheduler this slot's action should be posted back to.
    scheduler: Weak<Scheduler>,
}

struct FdState {
    fd: RawFd,
    interest: u32,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl FdState {
    fn new(fd: RawFd) -> Self {
        FdState {
            fd,
            interest: 0,
            read: None,
            write: None,
        }
    }

    fn slot_mut(&mut self, dir: u32) -> &mut Option<EventSlot> {
        if dir == READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

/// Sparse per-fd table, growing ×1.5 on demand (spec §3, §4.4).
struct FdTable {
    slots: Vec<Option<Mutex<FdState>>>,
}

impl FdTable {
    fn new() -> Self {
        FdTable { slots: Vec::new() }
    }

    fn ensure_capacity(&mut self, fd: usize) {
        if fd < self.slots.len() {
            return;
        }
        let new_len = ((fd + 1) as f64 * 1.5).ceil() as usize;
        self.slots.resize_with(new_len.max(fd + 1), || None);
    }

    fn get_or_create(&mut self, fd: RawFd) -> &Mutex<FdState> {
        self.ensure_capacity(fd as usize);
        let slot = &mut self.slots[fd as usize];
        slot.get_or_insert_with(|| Mutex::new(FdState::new(fd)))
    }

    fn get(&self, fd: RawFd) -> Option<&Mutex<FdState>> {
        self.slots.get(fd as usize).and_then(|s| s.as_ref())
    }
}

/// Combines a [`Scheduler`], a [`TimerManager`], and an epoll notifier into
/// the runtime's single public entry point (spec §4.4).
pub struct Reactor {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    fds: Mutex<FdTable>,
    epoll_fd: RawFd,
    self_pipe: [RawFd; 2],
    pending_events: AtomicUsize,
    max_events: usize,
    idle_wait_cap_ms: u64,
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<Reactor>>> = const { RefCell::new(None) };
}

/// Returns the reactor driving the current thread's dispatch loop, if any
/// (spec §6 `current_reactor()`).
pub fn current_reactor() -> Option<Arc<Reactor>> {
    CURRENT_REACTOR.with(|r| r.borrow().as_ref().and_then(Weak::upgrade))
}

fn set_current_reactor(reactor: &Arc<Reactor>) {
    CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(Arc::downgrade(reactor)));
}

impl Reactor {
    pub fn new(config: Config) -> Arc<Reactor> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epoll_fd >= 0, "corort: epoll_create1 failed");

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(rc, 0, "corort: pipe2 failed");

        let scheduler = Scheduler::with_stack_size(
            config.name.clone(),
            config.worker_threads,
            config.use_caller_thread,
            config.stack_size,
        );
        let timers = Arc::new(TimerManager::new());

        let reactor = Arc::new(Reactor {
            scheduler,
            timers,
            fds: Mutex::new(FdTable::new()),
            epoll_fd,
            self_pipe: pipe_fds,
            pending_events: AtomicUsize::new(0),
            max_events: config.max_events,
            idle_wait_cap_ms: config.idle_wait_cap_ms,
        });

        reactor.register_self_pipe();

        let hooks: Arc<dyn Hooks> = Arc::clone(&reactor) as Arc<dyn Hooks>;
        reactor.scheduler.set_hooks(hooks);

        {
            let reactor_weak = Arc::downgrade(&reactor);
            reactor.timers.set_on_insert_at_front(move || {
                if let Some(r) = reactor_weak.upgrade() {
                    Hooks::tickle(&*r);
                }
            });
        }

        {
            let reactor_weak = Arc::downgrade(&reactor);
            reactor.scheduler.set_on_thread_start(move || {
                if let Some(r) = reactor_weak.upgrade() {
                    set_current_reactor(&r);
                }
            });
        }

        reactor
    }

    fn register_self_pipe(&self) {
        let read_fd = self.self_pipe[0];
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: read_fd as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, read_fd, &mut ev)
        };
        assert_eq!(rc, 0, "corort: failed to register self-pipe on epoll");
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    /// Spawns the worker threads; each binds `self` as its current reactor
    /// before entering the dispatch loop (spec §4.2 `start`).
    pub fn start(self: &Arc<Self>) {
        self.scheduler.start();
    }

    pub fn stop(self: &Arc<Self>) {
        set_current_reactor(self);
        self.scheduler.stop();
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.self_pipe[0]);
            libc::close(self.self_pipe[1]);
        }
    }

    fn epoll_interest_bits(interest: u32) -> u32 {
        let mut bits = libc::EPOLLET as u32;
        if interest & READ != 0 {
            bits |= libc::EPOLLIN as u32;
        }
        if interest & WRITE != 0 {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    /// Registers interest in `dir` on `fd`, capturing either `cb` or the
    /// currently-running fiber (spec §4.4 `add_event`).
    ///
    /// The notifier call happens *before* the event slot is populated and
    /// the pending counter is incremented (spec §9 open question (b)): on
    /// notifier failure nothing has been recorded, so there is nothing to
    /// unwind.
    pub fn add_event(
        self: &Arc<Self>,
        fd: RawFd,
        dir: u32,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        let mut fds = self.fds.lock().unwrap();
        let state_mutex = fds.get_or_create(fd);
        let mut state = state_mutex.lock().unwrap();

        assert_eq!(
            state.interest & dir,
            0,
            "corort: double-registered {dir} event on fd {fd} (programming error)"
        );

        let new_interest = state.interest | dir;
        let op = if state.interest == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: Self::epoll_interest_bits(new_interest),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            error!("corort: epoll_ctl({op}) failed for fd {fd}: {err}");
            return Err(Error::Notifier {
                op: "add/mod",
                fd,
                source: err,
            });
        }

        // Only now, with the notifier registration confirmed, do we mutate
        // any state the failure path would have to unwind.
        state.interest = new_interest;
        let action = match cb {
            Some(cb) => SlotAction::Callback(cb),
            None => SlotAction::Fiber(
                crate::fiber::current().expect("corort: add_event() called off-fiber"),
            ),
        };
        let scheduler = current_scheduler()
            .map(|s| Arc::downgrade(&s))
            .unwrap_or_else(|| Arc::downgrade(&self.scheduler));
        *state.slot_mut(dir) = Some(EventSlot { action, scheduler });
        drop(state);
        drop(fds);
        self.pending_events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Removes interest in `dir` without invoking its callback (spec §4.4
    /// `del_event`).
    pub fn del_event(&self, fd: RawFd, dir: u32) {
        let fds = self.fds.lock().unwrap();
        let Some(state_mutex) = fds.get(fd) else {
            return;
        };
        let mut state = state_mutex.lock().unwrap();
        if state.interest & dir == 0 {
            return;
        }
        self.modify_notifier(fd, &mut state, dir, false);
        *state.slot_mut(dir) = None;
        drop(state);
        drop(fds);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
    }

    /// Like [`del_event`](Self::del_event), but synchronously fires the
    /// slot's callback as if readiness had occurred (spec §4.4
    /// `cancel_event`, used to complete a timed-out operation).
    pub fn cancel_event(&self, fd: RawFd, dir: u32) {
        let slot = {
            let fds = self.fds.lock().unwrap();
            let Some(state_mutex) = fds.get(fd) else {
                return;
            };
            let mut state = state_mutex.lock().unwrap();
            if state.interest & dir == 0 {
                return;
            }
            self.modify_notifier(fd, &mut state, dir, false);
            let slot = state.slot_mut(dir).take();
            slot
        };
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        if let Some(slot) = slot {
            Self::fire(slot);
        }
    }

    /// Drops `fd` from the notifier entirely and fires every slot still
    /// registered on it (spec §4.4 `cancel_all`, spec §7 "cancellation").
    pub fn cancel_all(&self, fd: RawFd) {
        let (read, write) = {
            let fds = self.fds.lock().unwrap();
            let Some(state_mutex) = fds.get(fd) else {
                return;
            };
            let mut state = state_mutex.lock().unwrap();
            if state.interest != 0 {
                unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            }
            let read = state.read.take();
            let write = state.write.take();
            state.interest = 0;
            (read, write)
        };
        for slot in [read, write].into_iter().flatten() {
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
            Self::fire(slot);
        }
    }

    fn modify_notifier(&self, fd: RawFd, state: &mut FdState, dir: u32, _removing_all: bool) {
        let new_interest = state.interest & !dir;
        if new_interest == 0 {
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        } else {
            let mut ev = libc::epoll_event {
                events: Self::epoll_interest_bits(new_interest),
                u64: fd as u64,
            };
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        }
        state.interest = new_interest;
    }

    /// Moves the slot's captured fiber/callback out and posts it to its
    /// recorded scheduler (spec §9 "break cycles by moving, not copying,
    /// out of the slot before invocation").
    fn fire(slot: EventSlot) {
        let Some(scheduler) = slot.scheduler.upgrade() else {
            return;
        };
        let task = match slot.action {
            SlotAction::Fiber(fib) => Task::Fiber(fib),
            SlotAction::Callback(cb) => Task::Callback(cb),
        };
        scheduler.schedule(task, -1);
    }

    fn drain_self_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(self.self_pipe[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }

    fn translate_events(raw: u32) -> u32 {
        let mut mask = 0;
        if raw & (libc::EPOLLIN as u32) != 0 {
            mask |= READ;
        }
        if raw & (libc::EPOLLOUT as u32) != 0 {
            mask |= WRITE;
        }
        if raw & ((libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0 {
            mask |= READ | WRITE;
        }
        mask
    }

    /// One iteration of the idle-fiber override (spec §4.4 pseudocode).
    fn idle_iteration_impl(self: &Arc<Self>) -> IdleOutcome {
        if self.scheduler.is_stopping()
            && self.pending_event_count() == 0
            && self.timers.is_empty()
        {
            return IdleOutcome::Stop;
        }

        let timeout_ms = self
            .timers
            .next_timeout()
            .map(|t| t.min(self.idle_wait_cap_ms))
            .unwrap_or(self.idle_wait_cap_ms) as i32;

        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            self.max_events
        ];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return IdleOutcome::Continue;
            }
            warn!("corort: epoll_wait failed: {err}");
            return IdleOutcome::Continue;
        }

        let mut expired = Vec::new();
        self.timers.collect_expired(&mut expired);
        for cb in expired {
            self.scheduler.schedule(Task::Callback(cb), -1);
        }

        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if fd == self.self_pipe[0] {
                self.drain_self_pipe();
                continue;
            }
            let fds = self.fds.lock().unwrap();
            let Some(state_mutex) = fds.get(fd) else {
                continue;
            };
            let mut state = state_mutex.lock().unwrap();
            let mut mask = Self::translate_events(ev.events as u32);
            mask &= state.interest;
            if mask == 0 {
                continue;
            }
            let new_interest = state.interest & !mask;
            if new_interest != state.interest {
                if new_interest == 0 {
                    unsafe {
                        libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
                    };
                } else {
                    let mut ev2 = libc::epoll_event {
                        events: Self::epoll_interest_bits(new_interest),
                        u64: fd as u64,
                    };
                    unsafe {
                        libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev2)
                    };
                }
                state.interest = new_interest;
            }
            let read_slot = if mask & READ != 0 { state.read.take() } else { None };
            let write_slot = if mask & WRITE != 0 { state.write.take() } else { None };
            drop(state);
            drop(fds);
            for slot in [read_slot, write_slot].into_iter().flatten() {
                self.pending_events.fetch_sub(1, Ordering::AcqRel);
                Self::fire(slot);
            }
        }

        trace!("corort: idle iteration processed {n} notifier events");
        IdleOutcome::Continue
    }
}

impl Hooks for Reactor {
    fn tickle(&self) {
        // Avoid unnecessary pipe traffic if no worker is actually idle
        // (spec §4.4 "tickle override").
        if self.scheduler.idle_thread_count() == 0 {
            return;
        }
        let byte = [1u8];
        unsafe {
            libc::write(self.self_pipe[1], byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn idle_iteration(&self) -> IdleOutcome {
        // Hooks takes `&self`; recover an `Arc` via the thread-local current
        // reactor (bound by the `on_thread_start` hook registered in
        // `Reactor::new`, before any worker enters its dispatch loop) so
        // `idle_iteration_impl`'s `Arc`-taking helpers work.
        match current_reactor() {
            Some(reactor) => reactor.idle_iteration_impl(),
            None => IdleOutcome::Continue,
        }
    }

    fn can_stop(&self) -> bool {
        self.pending_event_count() == 0 && self.timers.is_empty()
    }
}

/// Cancels a timer when it fires, used to implement timeouts on a hooked
/// blocking call (spec §5 "cancellation & timeouts"): register the
/// conditional timer, yield, then on resume check whether the timeout or the
/// readiness event won the race.
pub fn add_timeout_cancelling(
    reactor: &Arc<Reactor>,
    fd: RawFd,
    dir: u32,
    ms: u64,
) -> TimerId {
    let reactor = Arc::downgrade(reactor);
    reactor
        .upgrade()
        .expect("corort: add_timeout_cancelling() called on a dropped reactor")
        .timers
        .add_timer(
            ms,
            move || {
                if let Some(r) = reactor.upgrade() {
                    r.cancel_event(fd, dir);
                }
            },
            false,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn make_reactor(workers: usize) -> Arc<Reactor> {
        let config = Config::builder().worker_threads(workers).build();
        Reactor::new(config)
    }

    #[test]
    fn fd_table_grows_sparsely() {
        let mut table = FdTable::new();
        table.ensure_capacity(10);
        assert!(table.slots.len() >= 11);
        table.ensure_capacity(5);
        assert!(table.slots.len() >= 11);
    }

    #[test]
    fn add_then_del_event_never_fires_callback() {
        let reactor = make_reactor(1);
        let (r, w) = unsafe {
            let mut fds = [0 as RawFd; 2];
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK);
            (fds[0], fds[1])
        };
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        reactor
            .add_event(r, READ, Some(Box::new(move || fired2.store(true, Ordering::SeqCst))))
            .unwrap();
        reactor.del_event(r, READ);
        assert!(!fired.load(Ordering::SeqCst));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn cancel_event_fires_callback_exactly_once() {
        let reactor = make_reactor(1);
        let (r, w) = unsafe {
            let mut fds = [0 as RawFd; 2];
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK);
            (fds[0], fds[1])
        };
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        reactor
            .add_event(r, READ, Some(Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        reactor.start();
        reactor.cancel_event(r, READ);
        std::thread::sleep(Duration::from_millis(20));
        reactor.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let reactor = make_reactor(1);
        let (r, w) = unsafe {
            let mut fds = [0 as RawFd; 2];
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK);
            (fds[0], fds[1])
        };
        reactor
            .add_event(r, READ, Some(Box::new(|| {})))
            .unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reactor.add_event(r, READ, Some(Box::new(|| {}))).ok();
        }));
        assert!(result.is_err());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
