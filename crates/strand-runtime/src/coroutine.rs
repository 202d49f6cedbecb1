//! Stackful coroutines
//!
//! A coroutine is a callable with its own stack and saved register
//! file, switched cooperatively. Each thread has a distinguished
//! bootstrap coroutine standing for its native stack; worker threads
//! additionally designate a scheduling coroutine that task coroutines
//! switch against.
//!
//! Two switching flavors exist and must not be conflated:
//!
//! - `swap_in` / `swap_out` switch between the worker's scheduling
//!   coroutine and a task coroutine. Used by the scheduling loop and by
//!   every yield.
//! - `call` / `back` switch between the thread's bootstrap coroutine
//!   and a caller-mode scheduling coroutine. Used only when the
//!   scheduler also runs on its constructing thread.
//!
//! When the scheduler shares a thread with user code, the scheduling
//! loop is itself a child coroutine of that thread's bootstrap; tasks
//! switch against the scheduling coroutine while the scheduling
//! coroutine switches against the bootstrap. Mixing the two axes jumps
//! into a stale context.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strand_core::id::{self, CoId};
use strand_core::state::CoState;

use crate::arch::{self, SavedRegs};
use crate::config;
use crate::stack::Stack;
use crate::tls;

/// Boxed coroutine entry callable.
pub type CoFn = Box<dyn FnOnce() + Send + 'static>;

/// A stackful, cooperatively switched execution unit.
pub struct Coroutine {
    id: CoId,
    state: AtomicU8,
    regs: UnsafeCell<SavedRegs>,
    /// None only for a thread's bootstrap coroutine.
    stack: Option<Stack>,
    cb: Mutex<Option<CoFn>>,
    /// Finished/yield switches go to the bootstrap instead of the
    /// scheduling coroutine. Set only on caller-mode scheduling
    /// coroutines.
    run_in_caller: bool,
}

// SAFETY: `regs` is only read or written by the OS thread that is
// switching this coroutine in or out, and ownership of that right is
// handed between threads through the scheduler's locked task queue (a
// coroutine is never runnable on two workers at once; `swap_in` aborts
// on an Exec coroutine). All remaining fields are Sync on their own.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    fn new_bootstrap() -> Coroutine {
        id::coroutine_created();
        Coroutine {
            id: CoId::next(),
            state: AtomicU8::new(CoState::Exec as u8),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack: None,
            cb: Mutex::new(None),
            run_in_caller: false,
        }
    }

    /// Spawn a coroutine with the default stack size.
    pub fn spawn<F>(f: F) -> Arc<Coroutine>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn_with(Box::new(f), 0, false)
    }

    /// Spawn a coroutine.
    ///
    /// `stack_size` of 0 means the configured default. `run_in_caller`
    /// marks a caller-mode scheduling coroutine: when it finishes or
    /// yields at the top level it switches to the thread's bootstrap
    /// coroutine rather than a scheduling coroutine.
    pub fn spawn_with(cb: CoFn, stack_size: usize, run_in_caller: bool) -> Arc<Coroutine> {
        let size = if stack_size == 0 {
            config::current().stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(size).expect("coroutine stack allocation failed");
        id::coroutine_created();
        let co = Arc::new(Coroutine {
            id: CoId::next(),
            state: AtomicU8::new(CoState::Init as u8),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack: Some(stack),
            cb: Mutex::new(Some(cb)),
            run_in_caller,
        });
        // SAFETY: regs and stack belong to the coroutine we just built;
        // nobody else can reference them yet.
        unsafe {
            arch::init_context(
                co.regs.get(),
                co.stack.as_ref().unwrap().top(),
                coroutine_main as usize,
                0,
            );
        }
        co
    }

    /// The coroutine currently running on this thread, creating the
    /// bootstrap coroutine on first use.
    pub fn current() -> Arc<Coroutine> {
        if let Some(c) = tls::current() {
            return c;
        }
        let boot = Arc::new(Coroutine::new_bootstrap());
        tls::set_bootstrap(boot.clone());
        tls::set_current(boot.clone());
        boot
    }

    /// Id of the running coroutine, or 0 if this thread has never
    /// entered the coroutine system.
    pub fn current_id() -> u64 {
        tls::current().map(|c| c.id.as_u64()).unwrap_or(0)
    }

    /// Number of coroutines currently alive in the process, bootstrap
    /// coroutines included.
    pub fn total() -> u64 {
        id::total_live()
    }

    #[inline]
    pub fn id(&self) -> CoId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoState {
        CoState::from(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: CoState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn regs_ptr(&self) -> *mut SavedRegs {
        self.regs.get()
    }

    /// Rebind a finished (or never-started) coroutine to a new
    /// callable, reusing its stack.
    pub fn reset(&self, cb: CoFn) {
        assert!(
            self.stack.is_some(),
            "cannot reset the bootstrap coroutine"
        );
        let state = self.state();
        assert!(
            state.can_reset(),
            "reset of coroutine {} in state {}",
            self.id,
            state
        );
        *self.cb.lock() = Some(cb);
        // SAFETY: the coroutine is quiescent in a resettable state, so
        // nothing references its register file or stack.
        unsafe {
            arch::init_context(
                self.regs.get(),
                self.stack.as_ref().unwrap().top(),
                coroutine_main as usize,
                0,
            );
        }
        self.set_state(CoState::Init);
    }

    /// Switch from the worker's scheduling coroutine into this one.
    pub(crate) fn swap_in(self: &Arc<Self>) {
        let sched = tls::scheduler_co().expect("swap_in without a scheduling coroutine");
        assert!(
            !Arc::ptr_eq(self, &sched),
            "scheduling coroutine cannot swap into itself"
        );
        let prev = self.state.swap(CoState::Exec as u8, Ordering::SeqCst);
        assert!(
            prev != CoState::Exec as u8,
            "coroutine {} is already executing",
            self.id
        );
        tls::set_current(self.clone());
        // SAFETY: both register files are valid; we run on the
        // scheduling coroutine, so saving into its regs is saving our
        // own context.
        unsafe {
            arch::switch_context(sched.regs_ptr(), self.regs_ptr());
        }
    }

    /// Switch from this coroutine back to the worker's scheduling
    /// coroutine. The caller has already recorded the state it wants
    /// observed (Ready, Hold, Term, ...).
    pub(crate) fn swap_out(&self) {
        let sched = tls::scheduler_co().expect("swap_out without a scheduling coroutine");
        tls::set_current(sched.clone());
        // SAFETY: we execute on `self`, so saving into its regs is
        // saving our own context; the scheduling context was saved by
        // the swap_in that started us.
        unsafe {
            arch::switch_context(self.regs_ptr(), sched.regs_ptr());
        }
    }

    /// Switch from the thread's bootstrap coroutine into this one.
    /// Caller-mode only.
    pub(crate) fn call(self: &Arc<Self>) {
        let boot = ensure_bootstrap();
        self.set_state(CoState::Exec);
        tls::set_current(self.clone());
        // SAFETY: we run on the bootstrap (native) stack; see swap_in.
        unsafe {
            arch::switch_context(boot.regs_ptr(), self.regs_ptr());
        }
    }

    /// Switch from this coroutine back to the thread's bootstrap
    /// coroutine. Caller-mode only.
    pub(crate) fn back(&self) {
        let boot = tls::bootstrap().expect("back() on a thread without a bootstrap coroutine");
        tls::set_current(boot.clone());
        // SAFETY: see swap_out.
        unsafe {
            arch::switch_context(self.regs_ptr(), boot.regs_ptr());
        }
    }

    /// Yield the current coroutine and mark it Ready. The worker
    /// re-enqueues it after the context switch completes; yielding does
    /// not insert into the queue itself, so no other worker can resume
    /// the coroutine into a half-saved context.
    pub fn yield_to_ready() {
        let cur = Coroutine::current();
        cur.set_state(CoState::Ready);
        cur.swap_out();
    }

    /// Yield the current coroutine; it runs again only when someone
    /// re-schedules its handle.
    ///
    /// The state stays Exec across the switch and the worker records
    /// Hold once the context save is complete. A wake-up racing with
    /// the switch (event firing right after `add_event`) therefore
    /// enqueues a coroutine other workers still see as Exec and skip
    /// until it is actually resumable.
    pub fn yield_to_hold() {
        let cur = Coroutine::current();
        cur.swap_out();
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        id::coroutine_dropped();
        if self.stack.is_some() {
            let state = self.state();
            assert!(
                state.can_reset(),
                "dropping coroutine {} in state {}",
                self.id,
                state
            );
        }
    }
}

/// Bootstrap coroutine of this thread, created on first use.
pub(crate) fn ensure_bootstrap() -> Arc<Coroutine> {
    if let Some(b) = tls::bootstrap() {
        return b;
    }
    Coroutine::current();
    tls::bootstrap().expect("bootstrap just created")
}

/// Entry function of every spawned coroutine; invoked by the arch
/// trampoline. Runs the callable, records Term or Except, and switches
/// to the parent context. Never returns.
extern "C" fn coroutine_main(_arg: usize) {
    let cur = tls::current().expect("coroutine trampoline without a current coroutine");
    let cb = cur
        .cb
        .lock()
        .take()
        .expect("coroutine started without a callable");

    match panic::catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => cur.set_state(CoState::Term),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(coroutine = cur.id.as_u64(), %msg, "coroutine panicked");
            cur.set_state(CoState::Except);
        }
    }

    let parent = if cur.run_in_caller {
        tls::bootstrap().expect("finished caller-mode coroutine without a bootstrap")
    } else {
        tls::scheduler_co().expect("finished coroutine without a scheduling coroutine")
    };
    tls::set_current(parent.clone());
    let from = cur.regs_ptr();
    let to = parent.regs_ptr();
    // The worker (or caller) still holds an Arc to `cur`, and the TLS
    // slots hold one to `parent`; raw pointers stay valid across the
    // switch. Drop our handles before leaving this stack for good.
    drop(parent);
    drop(cur);
    // SAFETY: from/to point into live coroutines per the above.
    unsafe {
        arch::switch_context(from, to);
    }
    unreachable!("terminated coroutine was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_spawn_call_runs_to_term() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::spawn_with(
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            true,
        );
        assert_eq!(co.state(), CoState::Init);
        co.call();
        assert_eq!(co.state(), CoState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_runs_again() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::spawn_with(
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            true,
        );
        co.call();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        co.reset(Box::new(move || {
            h.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(co.state(), CoState::Init);
        co.call();
        assert_eq!(co.state(), CoState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panic_becomes_except() {
        let co = Coroutine::spawn_with(
            Box::new(|| {
                panic!("boom");
            }),
            0,
            true,
        );
        co.call();
        assert_eq!(co.state(), CoState::Except);
        // Except is a resettable state.
        co.reset(Box::new(|| {}));
        co.call();
        assert_eq!(co.state(), CoState::Term);
    }

    #[test]
    fn test_current_id_outside_is_zero_then_nonzero() {
        // Fresh test thread: no coroutine yet.
        std::thread::spawn(|| {
            assert_eq!(Coroutine::current_id(), 0);
            let boot = Coroutine::current();
            assert_eq!(Coroutine::current_id(), boot.id().as_u64());
            assert!(boot.id().as_u64() > 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_ids_distinct() {
        let a = Coroutine::spawn(|| {});
        let b = Coroutine::spawn(|| {});
        assert_ne!(a.id(), b.id());
        // Never started: Init is a droppable state.
    }

    #[test]
    fn test_callable_runs_at_most_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::spawn_with(
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            true,
        );
        co.call();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The callable was consumed; a second run requires reset().
        assert!(co.cb.lock().is_none());
    }
}
