//! Deadline-ordered timers
//!
//! Timers live in a map ordered by `(deadline, sequence)`, so equal deadlines
//! stay distinct and fire in insertion order. The reactor asks for the time
//! until the soonest deadline before every `epoll_wait` and collects the
//! expired callbacks afterwards.
//!
//! A [`TimerObserver`] is told when a new timer becomes the soonest one, at
//! most once between two [`TimerManager::next_timer`] queries.

use crate::config;
use crate::util;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Callback run when a timer expires
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Millisecond time source for timers
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds. Must not go backwards except in the
    /// rare clock rollback the manager detects.
    fn now_ms(&self) -> u64;
}

/// Process monotonic clock
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        util::monotonic_ms()
    }
}

/// Clock moved by hand, for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Clock starting at `start_ms`
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Jump to `ms` (backwards is allowed).
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Notified when a timer is inserted ahead of every other timer
pub trait TimerObserver: Send + Sync {
    /// The soonest deadline just moved earlier.
    fn on_timer_inserted_at_front(&self);
}

struct TimerState {
    /// Absolute deadline in clock milliseconds
    next: u64,
    /// Period (the original delay for one-shot timers)
    ms: u64,
    recurring: bool,
    /// `None` once cancelled or fired (one-shot)
    callback: Option<TimerCallback>,
}

struct Timer {
    /// Tie-breaker for equal deadlines
    seq: u64,
    manager: Weak<TimerShared>,
    state: Mutex<TimerState>,
}

type TimerKey = (u64, u64);

struct TimerShared {
    timers: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    /// Front insertion already reported since the last `next_timer`
    tickled: AtomicBool,
    /// Clock reading of the last expiry pass
    previous_ms: AtomicU64,
    next_seq: AtomicU64,
    clock: Arc<dyn Clock>,
    observer: OnceLock<Weak<dyn TimerObserver>>,
    rollover_threshold_ms: u64,
}

impl TimerShared {
    /// Insert under the held write lock; returns whether the observer must
    /// be told once the lock is released.
    fn insert_locked(&self, timers: &mut BTreeMap<TimerKey, Arc<Timer>>, key: TimerKey, timer: Arc<Timer>) -> bool {
        timers.insert(key, timer);
        let at_front = timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
            observer.on_timer_inserted_at_front();
        }
    }

    fn detect_clock_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::AcqRel);
        now < previous.saturating_sub(self.rollover_threshold_ms)
    }
}

/// Handle to a scheduled timer
#[derive(Clone)]
pub struct TimerHandle(Arc<Timer>);

impl TimerHandle {
    /// Remove the timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.0.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.timers.write();
        let mut state = self.0.state.lock();
        if state.callback.take().is_none() {
            return false;
        }
        timers.remove(&(state.next, self.0.seq));
        true
    }

    /// Restart the countdown: next deadline becomes now + delay.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.0.manager.upgrade() else {
            return false;
        };
        let mut timers = shared.timers.write();
        let mut state = self.0.state.lock();
        if state.callback.is_none() || timers.remove(&(state.next, self.0.seq)).is_none() {
            return false;
        }
        state.next = shared.clock.now_ms().saturating_add(state.ms);
        timers.insert((state.next, self.0.seq), Arc::clone(&self.0));
        true
    }

    /// Change the delay to `ms`.
    ///
    /// With `from_now` the next deadline is now + `ms`; otherwise it keeps the
    /// original anchor (previous deadline minus previous delay).
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.0.manager.upgrade() else {
            return false;
        };
        let notify = {
            let mut timers = shared.timers.write();
            let mut state = self.0.state.lock();
            if state.callback.is_none() {
                return false;
            }
            if ms == state.ms && !from_now {
                return true;
            }
            if timers.remove(&(state.next, self.0.seq)).is_none() {
                return false;
            }
            let start = if from_now {
                shared.clock.now_ms()
            } else {
                state.next.saturating_sub(state.ms)
            };
            state.ms = ms;
            state.next = start.saturating_add(ms);
            let key = (state.next, self.0.seq);
            drop(state);
            shared.insert_locked(&mut timers, key, Arc::clone(&self.0))
        };
        if notify {
            shared.notify_front();
        }
        true
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("TimerHandle")
            .field("seq", &self.0.seq)
            .field("next", &state.next)
            .field("ms", &state.ms)
            .field("recurring", &state.recurring)
            .field("active", &state.callback.is_some())
            .finish()
    }
}

/// Set of timers sharing one clock
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// Manager on the process monotonic clock, using the configured rollback
    /// threshold.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock), config::current().clock_rollover_threshold_ms)
    }

    /// Manager on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>, rollover_threshold_ms: u64) -> Self {
        let now = clock.now_ms();
        Self {
            shared: Arc::new(TimerShared {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: AtomicU64::new(now),
                next_seq: AtomicU64::new(1),
                clock,
                observer: OnceLock::new(),
                rollover_threshold_ms,
            }),
        }
    }

    /// Install the front-insertion observer. Only the first call takes effect.
    pub fn set_observer(&self, observer: Weak<dyn TimerObserver>) -> bool {
        self.shared.observer.set(observer).is_ok()
    }

    /// Current reading of the manager's clock
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Run `callback` after `ms` milliseconds (and every `ms` after that when
    /// `recurring`).
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let next = shared.clock.now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            seq: shared.next_seq.fetch_add(1, Ordering::Relaxed),
            manager: Arc::downgrade(shared),
            state: Mutex::new(TimerState {
                next,
                ms,
                recurring,
                callback: Some(Arc::new(callback)),
            }),
        });
        let notify = {
            let mut timers = shared.timers.write();
            shared.insert_locked(&mut timers, (next, timer.seq), Arc::clone(&timer))
        };
        if notify {
            shared.notify_front();
        }
        TimerHandle(timer)
    }

    /// Like [`TimerManager::add_timer`], but `callback` only runs while
    /// `guard` can still be upgraded.
    pub fn add_condition_timer<F, T>(&self, ms: u64, callback: F, guard: Weak<T>, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if let Some(_alive) = guard.upgrade() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Time until the soonest deadline (zero if already due), `None` when no
    /// timer is pending. Re-arms the front-insertion notification.
    pub fn next_timer(&self) -> Option<Duration> {
        self.shared.tickled.store(false, Ordering::Release);
        let timers = self.shared.timers.read();
        let (&(next, _), _) = timers.iter().next()?;
        let now = self.shared.clock.now_ms();
        Some(Duration::from_millis(next.saturating_sub(now)))
    }

    /// Remove every expired timer and return their callbacks in deadline order.
    ///
    /// Recurring timers are re-inserted one period after their previous
    /// deadline. After a backward clock jump beyond the rollback threshold
    /// every timer counts as expired and recurring ones restart from now.
    pub fn list_expired_callbacks(&self) -> Vec<TimerCallback> {
        let shared = &self.shared;
        let now = shared.clock.now_ms();
        if shared.timers.read().is_empty() {
            return Vec::new();
        }

        let mut timers = shared.timers.write();
        if timers.is_empty() {
            return Vec::new();
        }
        let rollover = shared.detect_clock_rollover(now);
        if rollover {
            tracing::warn!(target: crate::LOG_TARGET, now, "clock rollback detected, expiring all timers");
        } else if timers.keys().next().is_some_and(|&(next, _)| next > now) {
            return Vec::new();
        }

        let expired = if rollover {
            std::mem::take(&mut *timers)
        } else {
            let pending = timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut *timers, pending)
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let mut state = timer.state.lock();
            let Some(callback) = state.callback.clone() else {
                continue;
            };
            callbacks.push(callback);
            if state.recurring {
                state.next = if rollover {
                    now.saturating_add(state.ms)
                } else {
                    state.next.saturating_add(state.ms)
                };
                let key = (state.next, timer.seq);
                drop(state);
                timers.insert(key, timer);
            } else {
                state.callback = None;
            }
        }
        tracing::trace!(target: crate::LOG_TARGET, count = callbacks.len(), "timers expired");
        callbacks
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().is_empty()
    }

    /// Number of pending timers
    pub fn timer_count(&self) -> usize {
        self.shared.timers.read().len()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.timer_count())
            .finish()
    }
}
