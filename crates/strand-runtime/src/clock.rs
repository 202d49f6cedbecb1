//! Millisecond clock for timers
//!
//! CLOCK_MONOTONIC, expressed in milliseconds. The timer manager still
//! carries rollover detection for clocks that can step backwards; the
//! test-only skew below lets the rollover path be exercised without
//! perturbing other threads.

use std::cell::Cell;

thread_local! {
    static SKEW_MS: Cell<i64> = const { Cell::new(0) };
}

/// Current monotonic time in milliseconds.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is valid; CLOCK_MONOTONIC cannot fail on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    let ms = ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000;
    (ms + SKEW_MS.with(|s| s.get())).max(0) as u64
}

/// Shift this thread's view of the clock by `ms` (may be negative).
/// Test instrumentation for the rollover path; never used by the
/// runtime itself.
#[allow(dead_code)]
pub(crate) fn set_skew_ms(ms: i64) {
    SKEW_MS.with(|s| s.set(ms));
}
