//! An ordered set of future callbacks, keyed by `(deadline, insertion
//! sequence)` for O(log n) insert/remove and O(1) peek-min (spec §3, §4.3).

use log::warn;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

/// A timer's callable. Stored as `Arc<dyn Fn>` rather than `FnOnce` so a
/// recurring timer can be re-armed without re-registering its callback.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A scheduled callback ready to hand to a `Scheduler`, produced by
/// [`TimerManager::collect_expired`].
pub type ExpiredCallback = Box<dyn FnOnce() + Send + 'static>;

/// If the monotonic clock appears to have jumped backward by more than this,
/// treat every outstanding timer as potentially expired (spec §4.3 "clock
/// skew detection" — a defensive measure against misbehaving clock sources).
const CLOCK_SKEW_THRESHOLD_MS: i64 = 60 * 60 * 1000;

fn process_start() -> Instant {
    static START: once_cell::sync::OnceCell<Instant> = once_cell::sync::OnceCell::new();
    *START.get_or_init(Instant::now)
}

/// Monotonic milliseconds since process start.
pub fn now_ms() -> u64 {
    process_start().elapsed().as_millis() as u64
}

struct Entry {
    id: u64,
    period_ms: u64,
    recurring: bool,
    witness: Option<Weak<()>>,
    callback: Callback,
}

struct Inner {
    /// Ordered by (deadline_ms, sequence); sequence breaks ties and makes
    /// every key unique even when two timers share a deadline.
    by_deadline: BTreeMap<(u64, u64), Entry>,
    /// Secondary index so `cancel`/`reset` can find an entry by id without a
    /// linear scan.
    by_id: HashMap<u64, (u64, u64)>,
    last_now: u64,
}

/// An ordered set of `Timer`s. See spec §4.3 for the full contract.
pub struct TimerManager {
    inner: RwLock<Inner>,
    next_seq: AtomicU64,
    /// Invoked when an insertion becomes the new minimum (spec §4.3
    /// "insertion-at-front hook"). The `Reactor` overrides this to tickle a
    /// sleeping notifier. Lives outside the lock so it can be called without
    /// holding it across the call.
    on_insert_at_front: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            inner: RwLock::new(Inner {
                by_deadline: BTreeMap::new(),
                by_id: HashMap::new(),
                last_now: now_ms(),
            }),
            next_seq: AtomicU64::new(1),
            on_insert_at_front: RwLock::new(None),
        }
    }

    /// Registers the hook invoked whenever an insertion becomes the new
    /// earliest deadline.
    pub fn set_on_insert_at_front<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.on_insert_at_front.write().unwrap() = Some(Arc::new(f));
    }

    fn insert(
        &self,
        ms: u64,
        callback: Callback,
        recurring: bool,
        witness: Option<Weak<()>>,
    ) -> TimerId {
        let id = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = now_ms().saturating_add(ms);
        let key = (deadline, id);
        let became_min = {
            let mut inner = self.inner.write().unwrap();
            let became_min = inner
                .by_deadline
                .keys()
                .next()
                .map(|&min| key < min)
                .unwrap_or(true);
            inner.by_deadline.insert(
                key,
                Entry {
                    id,
                    period_ms: ms,
                    recurring,
                    witness,
                    callback,
                },
            );
            inner.by_id.insert(id, key);
            became_min
        };
        if became_min {
            if let Some(hook) = self.on_insert_at_front.read().unwrap().clone() {
                hook();
            }
        }
        TimerId(id)
    }

    /// Schedules `cb` to run after `ms` milliseconds; if `recurring`, it is
    /// re-armed every `ms` milliseconds until cancelled.
    pub fn add_timer<F: Fn() + Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: F,
        recurring: bool,
    ) -> TimerId {
        self.insert(ms, Arc::new(cb), recurring, None)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs if `witness`
    /// is still alive; otherwise the firing is silently skipped (spec §4.3
    /// "conditional timer").
    pub fn add_conditional_timer<F: Fn() + Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: F,
        witness: &Arc<()>,
        recurring: bool,
    ) -> TimerId {
        self.insert(ms, Arc::new(cb), recurring, Some(Arc::downgrade(witness)))
    }

    /// Cancels a timer; a no-op if it already fired or was already
    /// cancelled.
    pub fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.write().unwrap();
        if let Some(key) = inner.by_id.remove(&id.0) {
            inner.by_deadline.remove(&key);
        }
    }

    /// Re-keys a timer to fire after `ms` milliseconds, without touching its
    /// callback (spec §4.3 `reset(ms, from_now)`).
    ///
    /// If `from_now` is true, the new deadline is `ms` milliseconds from the
    /// current time. If false, it is `ms` milliseconds from the timer's
    /// original anchor (its previous deadline minus its previous period) —
    /// i.e. the timer's period changes but its phase does not.
    pub fn reset(&self, id: TimerId, ms: u64, from_now: bool) {
        let mut inner = self.inner.write().unwrap();
        let Some(key) = inner.by_id.remove(&id.0) else {
            return;
        };
        let Some(mut entry) = inner.by_deadline.remove(&key) else {
            return;
        };
        let new_deadline = if from_now {
            now_ms().saturating_add(ms)
        } else {
            let (old_deadline, _) = key;
            let anchor = old_deadline.saturating_sub(entry.period_ms);
            anchor.saturating_add(ms)
        };
        entry.period_ms = ms;
        let new_key = (new_deadline, id.0);
        inner.by_id.insert(id.0, new_key);
        inner.by_deadline.insert(new_key, entry);
    }

    /// Milliseconds until the earliest deadline, or `None` if there are no
    /// timers ("no timers" sentinel of spec §4.3).
    pub fn next_timeout(&self) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        let (&(deadline, _), _) = inner.by_deadline.iter().next()?;
        let now = now_ms();
        Some(if deadline > now { deadline - now } else { 0 })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().by_deadline.is_empty()
    }

    /// Removes every timer with deadline <= now, re-arms recurring ones, and
    /// appends their callbacks to `out` in deadline order. Detects backward
    /// monotonic-clock jumps and, if found, treats every outstanding timer
    /// as potentially expired this round (spec §4.3).
    pub fn collect_expired(&self, out: &mut Vec<ExpiredCallback>) {
        let now = now_ms();
        let mut inner = self.inner.write().unwrap();

        let skew = now as i64 - inner.last_now as i64;
        let clock_jumped_backward = skew < -CLOCK_SKEW_THRESHOLD_MS;
        if clock_jumped_backward {
            warn!(
                "corort: monotonic clock jumped backward by {}ms, re-evaluating all timers",
                -skew
            );
        }
        inner.last_now = now;

        let cutoff = if clock_jumped_backward {
            (u64::MAX, u64::MAX)
        } else {
            (now, u64::MAX)
        };

        let expired_keys: Vec<(u64, u64)> = inner
            .by_deadline
            .range(..=cutoff)
            .map(|(k, _)| *k)
            .collect();

        for key in expired_keys {
            let Some(entry) = inner.by_deadline.remove(&key) else {
                continue;
            };
            inner.by_id.remove(&entry.id);

            if entry.recurring {
                let new_deadline = now.saturating_add(entry.period_ms);
                let new_key = (new_deadline, entry.id);
                inner.by_id.insert(entry.id, new_key);
                inner.by_deadline.insert(
                    new_key,
                    Entry {
                        id: entry.id,
                        period_ms: entry.period_ms,
                        recurring: true,
                        witness: entry.witness.clone(),
                        callback: Arc::clone(&entry.callback),
                    },
                );
            }

            let witness = entry.witness;
            let callback = entry.callback;
            out.push(Box::new(move || {
                if let Some(w) = &witness {
                    if w.upgrade().is_none() {
                        return;
                    }
                }
                callback();
            }));
        }
    }
}

/// Opaque identifier returned by [`TimerManager::add_timer`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_fires_once() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            mgr.add_timer(0, move || { count.fetch_add(1, Ordering::SeqCst); }, false);
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
        for cb in out {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let mut out2 = Vec::new();
        mgr.collect_expired(&mut out2);
        assert!(out2.is_empty());
    }

    #[test]
    fn cancel_prevents_firing() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = {
            let fired = Arc::clone(&fired);
            mgr.add_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, false)
        };
        mgr.cancel(id);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conditional_timer_skips_when_witness_dropped() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let witness = Arc::new(());
        {
            let fired = Arc::clone(&fired);
            mgr.add_conditional_timer(0, move || { fired.fetch_add(1, Ordering::SeqCst); }, &witness, false);
            drop(witness);
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
        for cb in out {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_reports_none_when_empty() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), None);
        mgr.add_timer(1000, || {}, false);
        assert!(mgr.next_timeout().unwrap() <= 1000);
    }

    #[test]
    fn reset_from_now_rebases_on_the_current_time() {
        let mgr = TimerManager::new();
        let id = mgr.add_timer(1000, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(20));
        mgr.reset(id, 50, true);
        let remaining = mgr.next_timeout().unwrap();
        assert!(remaining <= 50, "from_now reset should count from now, got {remaining}ms left");
    }

    #[test]
    fn reset_not_from_now_keeps_the_original_anchor() {
        let mgr = TimerManager::new();
        // Anchor is effectively "now" (deadline - period == insertion time).
        let id = mgr.add_timer(100, || {}, false);
        mgr.reset(id, 200, false);
        // New deadline = anchor + 200 = insertion_time + 200, not now + 200.
        let remaining = mgr.next_timeout().unwrap();
        assert!(
            remaining <= 200,
            "from_now=false reset should still anchor near the original insertion, got {remaining}ms left"
        );
    }
}
