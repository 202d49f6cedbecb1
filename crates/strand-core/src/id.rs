//! Coroutine identity
//!
//! Ids are assigned from a process-wide monotonic counter and are never
//! zero; zero is reserved for "not a coroutine" (e.g. `current_id()` on a
//! thread that has never entered the coroutine system).

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Identifier of a coroutine. Non-zero, monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoId(u64);

impl CoId {
    /// Allocate the next id.
    pub fn next() -> CoId {
        CoId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bump the live-coroutine gauge. Called on coroutine construction.
#[inline]
pub fn coroutine_created() {
    LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Drop the live-coroutine gauge. Called on coroutine destruction.
#[inline]
pub fn coroutine_dropped() {
    LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
}

/// Number of coroutines currently alive in the process.
#[inline]
pub fn total_live() -> u64 {
    LIVE_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_monotonic_and_nonzero() {
        let a = CoId::next();
        let b = CoId::next();
        assert!(a.as_u64() > 0);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_live_gauge() {
        let before = total_live();
        coroutine_created();
        coroutine_created();
        assert_eq!(total_live(), before + 2);
        coroutine_dropped();
        assert_eq!(total_live(), before + 1);
        coroutine_dropped();
    }
}
