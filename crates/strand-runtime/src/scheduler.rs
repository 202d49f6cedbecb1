//! M:N coroutine scheduler
//!
//! N OS worker threads multiplex a FIFO queue of tasks (coroutines or
//! plain callables). Each worker runs a scheduling coroutine that picks
//! the next runnable task and context-switches into it; a task runs
//! until it finishes or voluntarily yields.
//!
//! With `use_caller` the constructing thread is counted as one worker:
//! a caller-mode scheduling coroutine is created on it and driven to
//! completion by `stop()`. If additional threads exist, tasks start
//! running as soon as they are scheduled; with only the caller thread,
//! everything runs inside `stop()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use strand_core::state::CoState;

use crate::coroutine::{CoFn, Coroutine};
use crate::hook;
use crate::tls;
use crate::util;

/// What a task runs.
pub enum Work {
    /// An existing coroutine handle.
    Co(Arc<Coroutine>),
    /// A plain callable; the worker wraps it in its reusable callback
    /// coroutine.
    Call(CoFn),
}

/// A unit of scheduled work plus an optional thread-affinity hint
/// (kernel thread id, or -1 for any worker).
pub struct Task {
    pub(crate) work: Work,
    pub(crate) thread: i64,
}

impl Task {
    /// Schedule a plain callable.
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            work: Work::Call(Box::new(f)),
            thread: -1,
        }
    }

    pub(crate) fn call_boxed(f: CoFn) -> Task {
        Task {
            work: Work::Call(f),
            thread: -1,
        }
    }

    /// Pin this task to a specific kernel thread id.
    pub fn with_thread(mut self, thread: i64) -> Task {
        self.thread = thread;
        self
    }
}

impl From<Arc<Coroutine>> for Task {
    fn from(co: Arc<Coroutine>) -> Task {
        Task {
            work: Work::Co(co),
            thread: -1,
        }
    }
}

/// Seams the scheduling loop exposes to its surrounding reactor.
///
/// The base scheduler wakes nobody on `tickle` and busy-yields in
/// `idle`; the I/O manager overrides all three to park workers in
/// `epoll_wait` and to gate shutdown on outstanding events and timers.
pub trait Dispatch: Send + Sync {
    /// Wake one worker blocked in `idle`.
    fn tickle(&self);

    /// Body of the per-worker idle coroutine. Must yield regularly and
    /// return when `stopping` holds.
    fn idle(&self);

    /// Termination predicate consulted by workers and `stop()`.
    fn stopping(&self) -> bool;

    /// Runs on each worker thread before its first task.
    fn on_thread_start(&self) {}
}

/// The coroutine scheduler.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// OS threads to spawn (caller excluded).
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// True until `start()`, true again once `stop()` is requested.
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    /// Kernel thread id of the caller in caller mode, else -1.
    root_thread: i64,
    /// Caller-mode scheduling coroutine.
    root_co: Mutex<Option<Arc<Coroutine>>>,
    dispatch: std::sync::OnceLock<Weak<dyn Dispatch>>,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads >= 1` workers. With
    /// `use_caller` the calling thread is one of them; its scheduling
    /// coroutine is created here and driven by `stop()`.
    pub fn new(mut threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let name = name.into();

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut root_thread = -1;
            let mut root_co = None;

            if use_caller {
                // Materialize this thread's bootstrap coroutine first;
                // the caller-mode scheduling coroutine switches against
                // it, not the other way around.
                Coroutine::current();
                threads -= 1;

                assert!(
                    tls::scheduler().is_none(),
                    "thread already belongs to a scheduler"
                );
                tls::set_scheduler(weak.clone());

                let w = weak.clone();
                let co = Coroutine::spawn_with(
                    Box::new(move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    }),
                    0,
                    true,
                );
                tls::set_scheduler_co(co.clone());
                root_thread = util::thread_id();
                root_co = Some(co);
            }

            Scheduler {
                name,
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count: threads,
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_thread,
                root_co: Mutex::new(root_co),
                dispatch: std::sync::OnceLock::new(),
                weak_self: weak.clone(),
            }
        })
    }

    /// The scheduler owning the current thread.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    /// The scheduling coroutine of this worker.
    pub fn scheduling_coroutine() -> Option<Arc<Coroutine>> {
        tls::scheduler_co()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_dispatch(&self, dispatch: Weak<dyn Dispatch>) {
        self.dispatch
            .set(dispatch)
            .unwrap_or_else(|_| panic!("dispatch already installed"));
    }

    fn dispatch(&self) -> Option<Arc<dyn Dispatch>> {
        self.dispatch.get().and_then(Weak::upgrade)
    }

    fn arc(&self) -> Arc<Scheduler> {
        self.weak_self.upgrade().expect("scheduler vanished")
    }

    /// Spawn the worker threads. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let mut threads = self.threads.lock();
        if !self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        for i in 0..self.thread_count {
            let me = self.arc();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", self.name, i))
                .spawn(move || me.run())
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
    }

    /// Enqueue one task; wakes a worker if the queue was empty.
    pub fn schedule(&self, task: impl Into<Task>) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(task.into());
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueue with a thread-affinity hint.
    pub fn schedule_with_thread(&self, task: impl Into<Task>, thread: i64) {
        self.schedule(task.into().with_thread(thread));
    }

    /// Batch enqueue with a single wake-up.
    pub fn schedule_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            let before = q.len();
            q.extend(tasks);
            was_empty && q.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn tickle(&self) {
        match self.dispatch() {
            Some(d) => d.tickle(),
            None => tracing::trace!(scheduler = %self.name, "tickle"),
        }
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Termination predicate: stop requested, auto-stop set, queue
    /// drained, and no worker mid-task (plus whatever the dispatch
    /// layers on top).
    pub fn stopping(&self) -> bool {
        match self.dispatch() {
            Some(d) => d.stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Request shutdown and wait for every worker to drain.
    ///
    /// In caller mode this must be invoked from the constructing
    /// thread; it drives the caller's scheduling coroutine to
    /// completion before returning.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        let root = self.root_co.lock().clone();

        if let Some(ref rc) = root {
            if self.thread_count == 0
                && matches!(rc.state(), CoState::Term | CoState::Init)
            {
                tracing::debug!(scheduler = %self.name, "stop");
                self.stop_requested.store(true, Ordering::SeqCst);
                if self.stopping() {
                    return;
                }
            }
        }

        if self.root_thread != -1 {
            // Caller mode: only the constructing thread may stop us.
            let cur = Scheduler::current();
            assert!(
                cur.map_or(false, |s| Arc::as_ptr(&s) == self as *const _),
                "caller-mode scheduler must be stopped from its constructing thread"
            );
        } else {
            let cur = Scheduler::current();
            assert!(
                cur.map_or(true, |s| Arc::as_ptr(&s) != self as *const _),
                "scheduler cannot stop itself from one of its own workers"
            );
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        // The caller-mode worker is not counted in thread_count; one
        // extra tickle flushes it.
        if root.is_some() {
            self.tickle();
        }

        if let Some(rc) = root {
            if !self.stopping() {
                rc.call();
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut threads = self.threads.lock();
            threads.drain(..).collect()
        };
        for h in handles {
            let _ = h.join();
        }
    }

    /// The scheduling loop. Runs directly on spawned worker threads and
    /// inside the caller-mode scheduling coroutine.
    fn run(self: &Arc<Self>) {
        tracing::debug!(scheduler = %self.name, thread = util::thread_id(), "worker loop start");
        hook::set_hook_enabled(true);
        tls::set_scheduler(self.weak_self.clone());
        if let Some(d) = self.dispatch() {
            d.on_thread_start();
        }

        if util::thread_id() != self.root_thread {
            // Spawned worker: the scheduling coroutine is this thread's
            // bootstrap.
            tls::set_scheduler_co(Coroutine::current());
        }

        let idle_weak = self.weak_self.clone();
        let idle_co = Coroutine::spawn(move || {
            let Some(sched) = idle_weak.upgrade() else {
                return;
            };
            match sched.dispatch() {
                Some(d) => d.idle(),
                None => sched.default_idle(),
            }
        });
        let mut cb_co: Option<Arc<Coroutine>> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut q = self.queue.lock();
                let mut i = 0;
                while i < q.len() {
                    // Affinity: skip tasks pinned to another worker but
                    // remember to wake it.
                    if q[i].thread != -1 && q[i].thread != util::thread_id() {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    // A coroutine still Exec is mid-switch on another
                    // worker; it becomes resumable the instant that
                    // worker records its post-switch state. Tickle so
                    // somebody retries promptly instead of parking for
                    // a full epoll timeout.
                    if let Work::Co(ref co) = q[i].work {
                        if co.state() == CoState::Exec {
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    task = q.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    // More runnable work behind us: wake another worker.
                    tickle_me |= i < q.len();
                    break;
                }
            }
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    work: Work::Co(co), ..
                }) => {
                    if co.state().is_done() {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    co.swap_in();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match co.state() {
                        CoState::Ready => self.schedule(co),
                        CoState::Term | CoState::Except => {}
                        _ => co.set_state(CoState::Hold),
                    }
                }
                Some(Task {
                    work: Work::Call(f),
                    ..
                }) => {
                    // Reuse one callback coroutine per worker; it is
                    // reset between callables.
                    let co = match cb_co.take() {
                        Some(c) => {
                            c.reset(f);
                            c
                        }
                        None => Coroutine::spawn_with(f, 0, false),
                    };
                    co.swap_in();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match co.state() {
                        CoState::Ready => self.schedule(co),
                        CoState::Term | CoState::Except => cb_co = Some(co),
                        _ => {
                            // Held by whoever will wake it; we drop our
                            // handle and build a fresh callback
                            // coroutine next time.
                            co.set_state(CoState::Hold);
                        }
                    }
                }
                None => {
                    if idle_co.state() == CoState::Term {
                        tracing::debug!(scheduler = %self.name, "idle coroutine terminated");
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_co.swap_in();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    if !idle_co.state().is_done() {
                        idle_co.set_state(CoState::Hold);
                    }
                }
            }
        }

        // Back-to-back stop tickles can coalesce into one edge on the
        // self-pipe; pass the wake along so the remaining workers do
        // not sit out a full epoll timeout.
        self.tickle();
        tracing::debug!(scheduler = %self.name, thread = util::thread_id(), "worker loop exit");
    }

    /// Idle body when no reactor is attached: spin-yield until the
    /// termination predicate holds.
    fn default_idle(&self) {
        while !self.stopping() {
            std::thread::yield_now();
            Coroutine::yield_to_hold();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("root_thread", &self.root_thread)
            .finish()
    }
}
