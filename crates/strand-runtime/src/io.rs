//! I/O manager: scheduler + timers + epoll
//!
//! Extends the scheduler with an epoll loop. Each descriptor of
//! interest has an fd-context carrying the currently registered event
//! mask and, per direction, the continuation (coroutine or callable)
//! to resume when the event fires. Workers with no runnable task park
//! in `epoll_wait`, bounded by the earliest timer deadline; a self-pipe
//! lets `tickle` wake one of them when new work arrives.
//!
//! Registration invariant: a direction's bit is set in the fd-context
//! mask iff the kernel holds a matching epoll registration. Firing
//! clears the bit and enqueues the continuation under the same per-fd
//! lock, so an event is consumed exactly once.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use libc::c_int;
use parking_lot::{Mutex, RwLock};

use crate::config;
use crate::coroutine::{CoFn, Coroutine};
use crate::scheduler::{Dispatch, Scheduler, Task};
use crate::timer::{Timer, TimerFn, TimerManager};
use crate::tls;

bitflags! {
    /// Directions a descriptor can be registered for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

const EPOLLET: u32 = libc::EPOLLET as u32;
const MAX_EVENTS: usize = 256;

/// Continuation for one direction of one descriptor.
#[derive(Default)]
struct EventCtx {
    scheduler: Weak<Scheduler>,
    co: Option<Arc<Coroutine>>,
    cb: Option<CoFn>,
}

impl EventCtx {
    fn clear(&mut self) {
        self.scheduler = Weak::new();
        self.co = None;
        self.cb = None;
    }
}

struct FdInner {
    events: EventSet,
    read: EventCtx,
    write: EventCtx,
}

impl FdInner {
    fn ctx_mut(&mut self, ev: EventSet) -> &mut EventCtx {
        if ev == EventSet::READ {
            &mut self.read
        } else if ev == EventSet::WRITE {
            &mut self.write
        } else {
            unreachable!("event context lookup needs a single direction")
        }
    }

    /// Clear the direction's bit and enqueue its continuation onto the
    /// scheduler recorded at registration. Caller holds the fd lock.
    fn trigger(&mut self, fd: c_int, ev: EventSet) {
        assert!(
            self.events.contains(ev),
            "triggering unregistered event: fd={} ev={:?} registered={:?}",
            fd,
            ev,
            self.events
        );
        self.events -= ev;
        let ctx = self.ctx_mut(ev);
        let sched = ctx.scheduler.upgrade();
        let task = if let Some(cb) = ctx.cb.take() {
            Task::call_boxed(cb)
        } else if let Some(co) = ctx.co.take() {
            Task::from(co)
        } else {
            ctx.clear();
            return;
        };
        ctx.clear();
        match sched {
            Some(s) => s.schedule(task),
            None => tracing::warn!(fd, ?ev, "event fired after its scheduler was dropped"),
        }
    }
}

/// Per-descriptor record owned by the I/O manager.
struct FdContext {
    fd: c_int,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: c_int) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: EventSet::empty(),
                read: EventCtx::default(),
                write: EventCtx::default(),
            }),
        }
    }
}

/// Scheduler with an epoll reactor and a timer manager fused in.
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: c_int,
    /// Self-pipe: [read end registered edge-triggered, write end].
    tickle_fds: [c_int; 2],
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    weak_self: Weak<IoManager>,
}

impl IoManager {
    /// Build the epoll instance and self-pipe, wire the scheduler and
    /// timer manager together, and start the workers. Resource failures
    /// here abort: nothing can run without them.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<IoManager> {
        // SAFETY: plain resource-creating syscalls, results checked.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            epfd >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );

        let mut tickle_fds = [0 as c_int; 2];
        let rt = unsafe { libc::pipe(tickle_fds.as_mut_ptr()) };
        assert!(rt == 0, "pipe failed: {}", io::Error::last_os_error());

        // Edge-triggered read end must be non-blocking so the drain
        // loop can stop at EAGAIN.
        unsafe {
            let flags = libc::fcntl(tickle_fds[0], libc::F_GETFL, 0);
            let rt = libc::fcntl(tickle_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            assert!(rt == 0, "fcntl failed: {}", io::Error::last_os_error());
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN as u32) | EPOLLET,
            u64: tickle_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) };
        assert!(rt == 0, "epoll_ctl failed: {}", io::Error::last_os_error());

        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let sched = Scheduler::new(threads, use_caller, name);
            let dispatch: Weak<dyn Dispatch> = weak.clone();
            sched.set_dispatch(dispatch);

            let timers = TimerManager::new();
            let w = weak.clone();
            timers.set_notify_front(Box::new(move || {
                if let Some(io) = w.upgrade() {
                    io.tickle();
                }
            }));

            IoManager {
                sched,
                timers,
                epfd,
                tickle_fds,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(Vec::new()),
                weak_self: weak.clone(),
            }
        });

        iom.resize_contexts(32);
        if use_caller {
            tls::set_io_manager(Arc::downgrade(&iom));
        }
        iom.sched.start();
        iom
    }

    /// The I/O manager owning the current thread.
    pub fn current() -> Option<Arc<IoManager>> {
        tls::io_manager()
    }

    #[inline]
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.sched.clone()
    }

    #[inline]
    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Enqueue a task; see [`Scheduler::schedule`].
    pub fn schedule(&self, task: impl Into<Task>) {
        self.sched.schedule(task);
    }

    /// Request shutdown and drain; see [`Scheduler::stop`]. Workers
    /// idle until pending events and timers reach zero, so outstanding
    /// I/O completes before this returns.
    pub fn stop(&self) {
        self.sched.stop();
    }

    /// Convenience pass-throughs to the timer manager.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(delay_ms, cb, recurring)
    }

    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.timers.add_conditional(delay_ms, cb, witness, recurring)
    }

    fn resize_contexts(&self, size: usize) {
        let mut v = self.contexts.write();
        let old = v.len();
        if old >= size {
            return;
        }
        v.reserve(size - old);
        for fd in old..size {
            v.push(Arc::new(FdContext::new(fd as c_int)));
        }
    }

    /// Fd-context lookup with ×1.5 growth. The table lock is released
    /// before any epoll_ctl.
    fn context_for(&self, fd: c_int) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let v = self.contexts.read();
            if (fd as usize) < v.len() {
                return v[fd as usize].clone();
            }
        }
        self.resize_contexts((fd as usize + 1) * 3 / 2);
        self.contexts.read()[fd as usize].clone()
    }

    /// Register interest in one direction of `fd`. With no callback the
    /// current coroutine is stored and resumed on fire.
    ///
    /// Registering a direction that is already registered is a
    /// programming error and aborts.
    pub fn add_event(&self, fd: c_int, ev: EventSet, cb: Option<CoFn>) -> io::Result<()> {
        assert!(
            ev == EventSet::READ || ev == EventSet::WRITE,
            "add_event takes a single direction"
        );
        let sched = Scheduler::current().expect("add_event outside a scheduler thread");
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock();

        assert!(
            !inner.events.contains(ev),
            "duplicate event registration: fd={} ev={:?} registered={:?}",
            fd,
            ev,
            inner.events
        );

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epev = libc::epoll_event {
            events: EPOLLET | (inner.events | ev).bits(),
            u64: fd as u64,
        };
        // SAFETY: epev is valid; fd may be anything, the kernel checks.
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(fd, ?ev, op, %err, "epoll_ctl failed");
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= ev;

        let ectx = inner.ctx_mut(ev);
        debug_assert!(ectx.co.is_none() && ectx.cb.is_none());
        ectx.scheduler = Arc::downgrade(&sched);
        match cb {
            Some(f) => ectx.cb = Some(f),
            None => {
                let cur = Coroutine::current();
                ectx.co = Some(cur);
            }
        }
        Ok(())
    }

    /// Drop a registration without firing its continuation.
    pub fn del_event(&self, fd: c_int, ev: EventSet) -> bool {
        let Some(ctx) = self.context_if_known(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(ev) {
            return false;
        }

        let remaining = inner.events - ev;
        if !self.kernel_update(fd, remaining) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = remaining;
        inner.ctx_mut(ev).clear();
        true
    }

    /// Drop a registration, firing its continuation exactly once.
    /// Returns false if the event was already delivered or canceled.
    pub fn cancel_event(&self, fd: c_int, ev: EventSet) -> bool {
        let Some(ctx) = self.context_if_known(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(ev) {
            return false;
        }

        let remaining = inner.events - ev;
        if !self.kernel_update(fd, remaining) {
            return false;
        }

        inner.trigger(ctx.fd, ev);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Fire and drop every registered direction of `fd`.
    pub fn cancel_all(&self, fd: c_int) -> bool {
        let Some(ctx) = self.context_if_known(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if !self.kernel_update(fd, EventSet::empty()) {
            return false;
        }

        if inner.events.contains(EventSet::READ) {
            inner.trigger(ctx.fd, EventSet::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(EventSet::WRITE) {
            inner.trigger(ctx.fd, EventSet::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// Wake one worker parked in `epoll_wait` by writing a byte into
    /// the self-pipe. No-op while every worker is busy: they re-check
    /// the queue before idling.
    pub fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        // SAFETY: one-byte write to our own pipe.
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const _, 1) };
        debug_assert_eq!(n, 1, "self-pipe write failed");
    }

    fn context_if_known(&self, fd: c_int) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let v = self.contexts.read();
        v.get(fd as usize).cloned()
    }

    /// Reconcile the kernel registration with `remaining`. Caller holds
    /// the fd lock.
    fn kernel_update(&self, fd: c_int, remaining: EventSet) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epev = libc::epoll_event {
            events: EPOLLET | remaining.bits(),
            u64: fd as u64,
        };
        // SAFETY: epev is valid for the duration of the call.
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(fd, op, %err, "epoll_ctl failed");
            return false;
        }
        true
    }

    /// Shutdown gate: drained scheduler, no registered events, no armed
    /// timers.
    fn reactor_stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// The idle coroutine body: park in `epoll_wait` bounded by the
    /// earliest timer deadline, then dispatch expired timers and fired
    /// events, then yield back to the scheduling loop.
    fn idle_loop(&self) {
        tracing::debug!(scheduler = %self.sched.name(), "io idle loop start");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let max_wait = config::current().epoll_wait_max_ms;

        loop {
            if self.reactor_stopping() {
                tracing::debug!(scheduler = %self.sched.name(), "io idle loop exit");
                break;
            }

            let timeout = match self.timers.next_deadline_ms() {
                Some(ms) => ms.min(max_wait),
                None => max_wait,
            };

            // EINTR retries keep the already-computed timeout.
            let n = loop {
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as c_int,
                        timeout as c_int,
                    )
                };
                if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break n;
            };

            let mut expired: Vec<TimerFn> = Vec::new();
            self.timers.collect_expired(&mut expired);
            if !expired.is_empty() {
                self.sched.schedule_batch(
                    expired
                        .into_iter()
                        .map(|cb| Task::call(move || (*cb)())),
                );
            }

            for ev in events.iter().take(n.max(0) as usize) {
                let revents = ev.events;
                let fd = ev.u64 as c_int;

                if fd == self.tickle_fds[0] {
                    let mut buf = [0u8; 256];
                    // Edge-triggered: drain until EAGAIN.
                    while unsafe {
                        libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut _, buf.len())
                    } > 0
                    {}
                    continue;
                }

                let Some(ctx) = self.context_if_known(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                // Error or hangup implies both directions may be ready.
                let mut revents = revents;
                if revents & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    revents |= (libc::EPOLLIN as u32) | (libc::EPOLLOUT as u32);
                }
                let returned = EventSet::from_bits_truncate(revents);
                // Only directions still registered count: the rest were
                // canceled concurrently.
                let fired = returned & inner.events;
                if fired.is_empty() {
                    continue;
                }

                let remaining = inner.events - fired;
                if !self.kernel_update(fd, remaining) {
                    continue;
                }

                if fired.contains(EventSet::READ) {
                    inner.trigger(fd, EventSet::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if fired.contains(EventSet::WRITE) {
                    inner.trigger(fd, EventSet::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Give the scheduling loop a chance to run what we queued.
            Coroutine::yield_to_hold();
        }
    }
}

impl Dispatch for IoManager {
    fn tickle(&self) {
        IoManager::tickle(self);
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn stopping(&self) -> bool {
        self.reactor_stopping()
    }

    fn on_thread_start(&self) {
        tls::set_io_manager(self.weak_self.clone());
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold strong references while running, so reaching
        // Drop means they have all exited (stop() completed or start
        // never happened). Only the kernel resources remain.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched.name())
            .field("pending_events", &self.pending.load(Ordering::SeqCst))
            .finish()
    }
}
