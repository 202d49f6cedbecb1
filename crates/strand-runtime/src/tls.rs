//! Thread-local runtime state
//!
//! The design keeps exactly these mutable thread-locals: the running
//! coroutine (updated on every context switch), the thread's bootstrap
//! coroutine, the scheduling coroutine tasks switch against, the
//! scheduler the thread belongs to, the I/O manager behind it, and the
//! per-thread hook-enable flag. Everything else is owned by an object.
//!
//! Borrows are always released before a context switch; holding one
//! across a switch would wedge the slot for whatever runs next on this
//! thread.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::coroutine::Coroutine;
use crate::io::IoManager;
use crate::scheduler::Scheduler;

thread_local! {
    /// Coroutine currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// The coroutine representing this thread's native stack.
    static BOOTSTRAP: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// The scheduling coroutine of this worker; tasks switch against it.
    static SCHED_CO: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// The scheduler this thread belongs to.
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// The I/O manager this thread belongs to.
    static IO: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };

    /// Per-thread hook enable switch; off by default.
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

pub fn current() -> Option<Arc<Coroutine>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub fn set_current(co: Arc<Coroutine>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(co));
}

pub fn bootstrap() -> Option<Arc<Coroutine>> {
    BOOTSTRAP.with(|c| c.borrow().clone())
}

pub fn set_bootstrap(co: Arc<Coroutine>) {
    BOOTSTRAP.with(|c| *c.borrow_mut() = Some(co));
}

pub fn scheduler_co() -> Option<Arc<Coroutine>> {
    SCHED_CO.with(|c| c.borrow().clone())
}

pub fn set_scheduler_co(co: Arc<Coroutine>) {
    SCHED_CO.with(|c| *c.borrow_mut() = Some(co));
}

pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

pub fn scheduler_weak() -> Weak<Scheduler> {
    SCHEDULER.with(|c| c.borrow().clone()).unwrap_or_default()
}

pub fn set_scheduler(sched: Weak<Scheduler>) {
    SCHEDULER.with(|c| *c.borrow_mut() = Some(sched));
}

pub fn io_manager() -> Option<Arc<IoManager>> {
    IO.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

pub fn set_io_manager(io: Weak<IoManager>) {
    IO.with(|c| *c.borrow_mut() = Some(io));
}

#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

#[inline]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}
