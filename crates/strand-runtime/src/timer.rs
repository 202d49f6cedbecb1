//! Timer manager
//!
//! An ordered set of absolute-deadline timers: one-shot, periodic, and
//! conditional (fire only while a weak witness is still alive). The
//! surrounding epoll loop asks for the earliest deadline to bound its
//! wait and collects expired callables each time it wakes.
//!
//! Ordering is by (deadline, id); the id breaks ties so the set is a
//! total order and the first entry is always the earliest deadline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::clock;

/// Shared timer callable; periodic timers invoke it once per period.
pub type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// A clock step backwards larger than this flushes every timer on the
/// next collection, so a rollback cannot park timers forever.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerShared {
    id: u64,
    recurring: bool,
    /// Relative delay (one-shot) or period (recurring), in ms.
    period_ms: AtomicU64,
    /// Absolute deadline in ms; rewritten only under the manager's
    /// write lock.
    deadline_ms: AtomicU64,
    /// Cleared when the timer is canceled or a one-shot fires, making
    /// later cancels no-ops.
    cb: Mutex<Option<TimerFn>>,
}

impl TimerShared {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::SeqCst), self.id)
    }
}

/// Handle to a live timer. Jointly owned with the manager; either side
/// may cancel.
pub struct Timer {
    shared: Arc<TimerShared>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Drop the callable and erase the timer. Returns false if it
    /// already fired (one-shot) or was already canceled.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write();
        {
            let mut cb = self.shared.cb.lock();
            if cb.is_none() {
                return false;
            }
            *cb = None;
        }
        inner.timers.remove(&self.shared.key());
        true
    }

    /// Move the deadline to now + period. Returns false on a dead
    /// timer.
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write();
        if self.shared.cb.lock().is_none() {
            return false;
        }
        let Some(shared) = inner.timers.remove(&self.shared.key()) else {
            return false;
        };
        let deadline = clock::now_ms() + self.shared.period_ms.load(Ordering::SeqCst);
        self.shared.deadline_ms.store(deadline, Ordering::SeqCst);
        inner.timers.insert(self.shared.key(), shared);
        true
    }

    /// Change the period; with `from_now` the deadline rebases to now,
    /// otherwise it keeps the original start point. Goes through the
    /// insert path so an earlier deadline re-arms the epoll wait.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.shared.period_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write();
        if self.shared.cb.lock().is_none() {
            return false;
        }
        if inner.timers.remove(&self.shared.key()).is_none() {
            return false;
        }
        let start = if from_now {
            clock::now_ms()
        } else {
            self.shared
                .deadline_ms
                .load(Ordering::SeqCst)
                .saturating_sub(self.shared.period_ms.load(Ordering::SeqCst))
        };
        self.shared.period_ms.store(period_ms, Ordering::SeqCst);
        self.shared
            .deadline_ms
            .store(start + period_ms, Ordering::SeqCst);
        mgr.insert_locked(inner, self.shared.clone());
        true
    }
}

struct TimerInner {
    timers: BTreeMap<(u64, u64), Arc<TimerShared>>,
    /// Last observed clock reading, for rollover detection.
    previous_ms: u64,
}

/// Ordered set of timers with an at-front-insertion notification.
pub struct TimerManager {
    inner: RwLock<TimerInner>,
    /// Suppresses repeated front-insert notifications until the next
    /// deadline query.
    tickled: AtomicBool,
    /// Invoked (outside the lock) when a new timer becomes the
    /// earliest; the epoll loop shortens its wait in response.
    notify_front: std::sync::OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            inner: RwLock::new(TimerInner {
                timers: BTreeMap::new(),
                previous_ms: clock::now_ms(),
            }),
            tickled: AtomicBool::new(false),
            notify_front: std::sync::OnceLock::new(),
        })
    }

    pub(crate) fn set_notify_front(&self, f: Box<dyn Fn() + Send + Sync>) {
        self.notify_front
            .set(f)
            .unwrap_or_else(|_| panic!("front notification already installed"));
    }

    /// Add a timer firing `delay_ms` from now; `recurring` re-arms it
    /// every `delay_ms` after each fire.
    pub fn add_timer(
        self: &Arc<Self>,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let shared = Arc::new(TimerShared {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(delay_ms),
            deadline_ms: AtomicU64::new(clock::now_ms() + delay_ms),
            cb: Mutex::new(Some(Arc::new(cb))),
        });
        let timer = Timer {
            shared: shared.clone(),
            manager: Arc::downgrade(self),
        };
        let inner = self.inner.write();
        self.insert_locked(inner, shared);
        timer
    }

    /// Add a timer whose callable only runs if `witness` is still alive
    /// at fire time.
    pub fn add_conditional<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            delay_ms,
            move || {
                if witness.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: None if no timer is
    /// armed, 0 if one is already overdue. Also re-arms the
    /// front-insert notification.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::SeqCst);
        let inner = self.inner.read();
        let (deadline, _) = inner.timers.keys().next()?;
        Some(deadline.saturating_sub(clock::now_ms()))
    }

    /// True if any timer is armed.
    pub fn has_timer(&self) -> bool {
        !self.inner.read().timers.is_empty()
    }

    /// Append the callables of every expired timer to `out`; recurring
    /// timers are re-armed at now + period, fired one-shots drop their
    /// callable so later cancels are no-ops.
    pub fn collect_expired(&self, out: &mut Vec<TimerFn>) {
        let now = clock::now_ms();
        {
            let inner = self.inner.read();
            if inner.timers.is_empty() {
                return;
            }
        }
        let mut inner = self.inner.write();
        if inner.timers.is_empty() {
            return;
        }

        let rollover = Self::detect_rollover(&mut inner, now);
        if !rollover {
            match inner.timers.keys().next() {
                Some((first, _)) if *first > now => return,
                None => return,
                _ => {}
            }
        }

        // Everything with deadline <= now; on rollover, everything.
        let expired = if rollover {
            std::mem::take(&mut inner.timers)
        } else {
            let rest = inner.timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut inner.timers, rest)
        };

        out.reserve(expired.len());
        for (_, shared) in expired {
            let cb = {
                let mut slot = shared.cb.lock();
                if shared.recurring {
                    slot.clone()
                } else {
                    slot.take()
                }
            };
            // Canceled concurrently with the collection: nothing to run.
            let Some(cb) = cb else { continue };
            out.push(cb);
            if shared.recurring {
                let deadline = now + shared.period_ms.load(Ordering::SeqCst);
                shared.deadline_ms.store(deadline, Ordering::SeqCst);
                inner.timers.insert((deadline, shared.id), shared);
            }
        }
    }

    fn detect_rollover(inner: &mut TimerInner, now: u64) -> bool {
        let rollover =
            now < inner.previous_ms && now + ROLLOVER_WINDOW_MS < inner.previous_ms;
        inner.previous_ms = now;
        rollover
    }

    /// Insert under the held write lock; if the new timer became the
    /// earliest and nobody was notified since the last deadline query,
    /// fire the front notification after unlocking.
    fn insert_locked(&self, mut inner: RwLockWriteGuard<'_, TimerInner>, shared: Arc<TimerShared>) {
        let key = shared.key();
        inner.timers.insert(key, shared);
        let at_front = inner.timers.keys().next() == Some(&key)
            && !self.tickled.swap(true, Ordering::SeqCst);
        drop(inner);
        if at_front {
            if let Some(notify) = self.notify_front.get() {
                notify();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain(mgr: &Arc<TimerManager>) -> usize {
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        let n = out.len();
        for cb in out {
            (*cb)();
        }
        n
    }

    #[test]
    fn test_expiry_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let o = order.clone();
            mgr.add_timer(delay, move || o.lock().push(tag), false);
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(drain(&mgr), 3);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_deadline() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_deadline_ms(), None);
        let _t = mgr.add_timer(500, || {}, false);
        let next = mgr.next_deadline_ms().unwrap();
        assert!(next <= 500);
        assert!(next > 400);
    }

    #[test]
    fn test_overdue_deadline_is_zero() {
        let mgr = TimerManager::new();
        let _t = mgr.add_timer(0, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(mgr.next_deadline_ms(), Some(0));
    }

    #[test]
    fn test_cancel_prevents_fire_and_is_idempotent() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr.add_timer(5, move || { h.fetch_add(1, Ordering::SeqCst); }, false);
        assert!(t.cancel());
        assert!(!t.cancel());
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert_eq!(drain(&mgr), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(1, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(drain(&mgr), 1);
        assert!(!t.cancel());
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr.add_timer(5, move || { h.fetch_add(1, Ordering::SeqCst); }, true);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(drain(&mgr), 1);
        assert!(mgr.has_timer());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(t.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(40, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(t.refresh());
        // Refreshed to now + 40: nothing fires at the original deadline.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(drain(&mgr), 0);
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(drain(&mgr), 1);
    }

    #[test]
    fn test_reset_changes_period() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(500, || {}, false);
        assert!(t.reset(10, true));
        std::thread::sleep(std::time::Duration::from_millis(25));
        assert_eq!(drain(&mgr), 1);
    }

    #[test]
    fn test_conditional_witness_dropped() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let witness = Arc::new(());
        let _t = mgr.add_conditional(
            5,
            move || { h.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&witness),
            false,
        );
        drop(witness);
        std::thread::sleep(std::time::Duration::from_millis(15));
        // The callable is collected but the witness is gone: no effect.
        drain(&mgr);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_conditional_witness_alive() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let witness = Arc::new(());
        let _t = mgr.add_conditional(
            5,
            move || { h.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&witness),
            false,
        );
        std::thread::sleep(std::time::Duration::from_millis(15));
        drain(&mgr);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(witness);
    }

    #[test]
    fn test_front_insert_notifies_once() {
        let mgr = TimerManager::new();
        let notifies = Arc::new(AtomicUsize::new(0));
        let n = notifies.clone();
        mgr.set_notify_front(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        let _a = mgr.add_timer(1000, || {}, false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
        // Later deadline: not at front, no notification.
        let _b = mgr.add_timer(2000, || {}, false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
        // Earlier deadline, but the flag is still set: suppressed.
        let _c = mgr.add_timer(500, || {}, false);
        assert_eq!(notifies.load(Ordering::SeqCst), 1);
        // Deadline query clears the flag; the next front insert fires.
        let _ = mgr.next_deadline_ms();
        let _d = mgr.add_timer(100, || {}, false);
        assert_eq!(notifies.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clock_rollover_flushes_all() {
        // Run the whole scenario three hours in the future, then step
        // the clock back to the real present: a two-plus-hour rollback.
        crate::clock::set_skew_ms(3 * 60 * 60 * 1000);
        let mgr = TimerManager::new();
        let _t = mgr.add_timer(10_000, || {}, false);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert!(out.is_empty());

        crate::clock::set_skew_ms(0);
        mgr.collect_expired(&mut out);

        assert_eq!(out.len(), 1);
        assert!(!mgr.has_timer());
    }
}
