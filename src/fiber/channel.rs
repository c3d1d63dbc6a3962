//! A fiber-aware bounded MPMC channel.
//!
//! Sending on a full channel (or receiving on an empty one) yields the
//! calling fiber rather than blocking the worker thread; a successful send
//! or receive reschedules whichever fiber was waiting on the other end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use crate::fiber::Fiber;
use crate::scheduler::{current_scheduler, Task};

struct Inner<T> {
    buf: VecDeque<T>,
    capacity: usize,
    tx_count: usize,
    rx_count: usize,
    send_waiters: VecDeque<Arc<Fiber>>,
    recv_waiters: VecDeque<Arc<Fiber>>,
}

struct Channel<T> {
    state: StdMutex<Inner<T>>,
}

impl<T> Channel<T> {
    fn new(capacity: u32) -> Self {
        Channel {
            state: StdMutex::new(Inner {
                buf: VecDeque::new(),
                capacity: capacity.max(1) as usize,
                tx_count: 0,
                rx_count: 0,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            }),
        }
    }

    fn wake(fib: Option<Arc<Fiber>>) {
        if let Some(fib) = fib {
            if let Some(sched) = current_scheduler() {
                sched.schedule(Task::Fiber(fib), -1);
            }
        }
    }

    fn send(&self, t: T, timeout: Option<Duration>) -> Result<(), SendError<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut value = Some(t);
        loop {
            let (woke, disconnected) = {
                let mut inner = self.state.lock().unwrap();
                if inner.rx_count == 0 {
                    (None, true)
                } else if inner.buf.len() < inner.capacity {
                    inner.buf.push_back(value.take().unwrap());
                    (inner.recv_waiters.pop_front(), false)
                } else {
                    (None, false)
                }
            };
            if disconnected {
                return Err(SendError::Disconnected(value.unwrap()));
            }
            if value.is_none() {
                Self::wake(woke);
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SendError::Timeout(value.unwrap()));
                }
            }
            let this = crate::fiber::current().expect("corort: Channel::send() called off-fiber");
            self.state.lock().unwrap().send_waiters.push_back(this);
            Fiber::yield_now();
        }
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<T, RecvError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let (item, woke, disconnected) = {
                let mut inner = self.state.lock().unwrap();
                if let Some(item) = inner.buf.pop_front() {
                    (Some(item), inner.send_waiters.pop_front(), false)
                } else if inner.tx_count == 0 {
                    (None, None, true)
                } else {
                    (None, None, false)
                }
            };
            if let Some(item) = item {
                Self::wake(woke);
                return Ok(item);
            }
            if disconnected {
                return Err(RecvError::Disconnected);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(RecvError::Timeout);
                }
            }
            let this = crate::fiber::current().expect("corort: Channel::recv() called off-fiber");
            self.state.lock().unwrap().recv_waiters.push_back(this);
            Fiber::yield_now();
        }
    }

    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().buf.is_empty()
    }
}

/// Creates a bounded channel with room for `capacity` in-flight messages.
pub fn bounded<T>(capacity: u32) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Channel::new(capacity));
    (Sender::new(Arc::clone(&chan)), Receiver::new(chan))
}

pub struct Sender<T> {
    chan: Arc<Channel<T>>,
}

impl<T> Sender<T> {
    fn new(chan: Arc<Channel<T>>) -> Self {
        chan.state.lock().unwrap().tx_count += 1;
        Self { chan }
    }

    /// Sends `t`, yielding the calling fiber until there's room (spec §9
    /// "channels as timer-info delivery" pattern generalized to a reusable
    /// primitive).
    pub fn send(&self, t: T) -> Result<(), T> {
        self.chan.send(t, None).map_err(|e| match e {
            SendError::Timeout(_) => unreachable!("send() has no deadline"),
            SendError::Disconnected(t) => t,
        })
    }

    pub fn send_timeout(&self, t: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.chan.send(t, Some(timeout))
    }

    pub fn try_send(&self, t: T) -> Result<(), TrySendError<T>> {
        self.send_timeout(t, Duration::ZERO).map_err(From::from)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.chan))
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.chan.state.lock().unwrap();
        inner.tx_count -= 1;
        if inner.tx_count == 0 {
            let waiters = std::mem::take(&mut inner.recv_waiters);
            drop(inner);
            for w in waiters {
                Channel::<T>::wake(Some(w));
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Timeout(T),
    Disconnected(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(t) | Self::Disconnected(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Disconnected(t) => Self::Disconnected(t),
            SendError::Timeout(t) => Self::Full(t),
        }
    }
}

pub struct Receiver<T> {
    chan: Arc<Channel<T>>,
}

impl<T> Receiver<T> {
    fn new(chan: Arc<Channel<T>>) -> Self {
        chan.state.lock().unwrap().rx_count += 1;
        Self { chan }
    }

    pub fn recv(&self) -> Option<T> {
        match self.chan.recv(None) {
            Err(RecvError::Timeout) => unreachable!("recv() has no deadline"),
            res => res.ok(),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.chan.recv(Some(timeout))
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.recv_timeout(Duration::ZERO).map_err(From::from)
    }

    pub fn is_empty(&self) -> bool {
        self.chan.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }
}

pub struct Iter<'a, T: 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.chan))
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.chan.state.lock().unwrap();
        inner.rx_count -= 1;
        if inner.rx_count == 0 {
            let waiters = std::mem::take(&mut inner.send_waiters);
            drop(inner);
            for w in waiters {
                Channel::<T>::wake(Some(w));
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Disconnected => Self::Disconnected,
            RecvError::Timeout => Self::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, Task};

    #[test]
    fn send_then_recv_round_trips() {
        let (tx, rx) = bounded::<i32>(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), Some(2));
    }

    #[test]
    fn disconnected_recv_returns_none() {
        let (tx, rx) = bounded::<i32>(1);
        drop(tx);
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn producer_consumer_fibers_hand_off_through_scheduler() {
        let (tx, rx) = bounded::<i32>(1);
        let sched = Scheduler::new("chan-test", 2, false);
        sched.schedule(
            Task::Fiber(Fiber::new("producer", move || {
                for i in 0..5 {
                    tx.send(i).unwrap();
                }
            })),
            -1,
        );
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        sched.schedule(
            Task::Fiber(Fiber::new("consumer", move || {
                for _ in 0..5 {
                    if let Some(v) = rx.recv() {
                        received2.lock().unwrap().push(v);
                    }
                }
            })),
            -1,
        );
        sched.start();
        sched.stop();
        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
