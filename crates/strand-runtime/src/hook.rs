//! Hooked blocking syscalls
//!
//! Signature-compatible stand-ins for the POSIX calls they shadow.
//! With the per-thread hook switch off (the default) every function
//! delegates to the raw syscall, so code that does not cooperate with
//! the scheduler keeps normal blocking behavior. The scheduling loop
//! turns the switch on before running any task; on those threads a
//! would-block operation registers an event with the I/O manager,
//! parks the calling coroutine, and resumes on readiness, timeout, or
//! cancellation.
//!
//! The generic template:
//!
//! 1. try the raw syscall, retrying EINTR;
//! 2. anything but EAGAIN/EWOULDBLOCK returns verbatim;
//! 3. otherwise arm a conditional timer (if the descriptor carries a
//!    timeout), register the direction with the reactor, and yield;
//! 4. on resume, a set cancel-code means timeout/cancel; otherwise the
//!    descriptor is ready and the loop retries the raw call.
//!
//! The shared timer-info record arbitrates between event fire and
//! timer expiry so each call produces exactly one outcome.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use libc::{c_int, c_uint, c_ulong, c_void, size_t, sockaddr, socklen_t, ssize_t};

use crate::config;
use crate::coroutine::Coroutine;
use crate::fdmeta::{registry, NO_TIMEOUT};
use crate::io::{EventSet, IoManager};
use crate::tls;

// Not exposed by the vendored `libc` crate on this target; values match
// the kernel's <asm-generic/fcntl.h> ABI.
#[allow(non_upper_case_globals)]
const F_SETSIG: c_int = 10;
#[allow(non_upper_case_globals)]
const F_GETSIG: c_int = 11;
#[allow(non_upper_case_globals)]
const F_SETOWN_EX: c_int = 15;
#[allow(non_upper_case_globals)]
const F_GETOWN_EX: c_int = 16;

#[repr(C)]
struct f_owner_ex {
    #[allow(dead_code)]
    type_: c_int,
    #[allow(dead_code)]
    pid: libc::pid_t,
}

/// Is the hook layer active on this thread?
#[inline]
pub fn is_hook_enabled() -> bool {
    tls::hook_enabled()
}

/// Flip the hook layer for this thread.
#[inline]
pub fn set_hook_enabled(enabled: bool) {
    tls::set_hook_enabled(enabled);
}

#[inline]
fn errno() -> c_int {
    // SAFETY: __errno_location always returns a valid thread-local.
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: c_int) {
    // SAFETY: as above.
    unsafe {
        *libc::__errno_location() = e;
    }
}

/// Arbitration record between an I/O event and its deadline timer.
/// Zero while pending; otherwise the errno the call must report.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Generic hooked-I/O template. `raw` performs the underlying syscall
/// and is retried once the descriptor signals readiness.
fn do_io<F>(fd: c_int, name: &'static str, event: EventSet, timeout_kind: c_int, raw: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !is_hook_enabled() {
        return raw();
    }
    let Some(meta) = registry().get(fd) else {
        return raw();
    };
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return raw();
    }

    let timeout_ms = meta.timeout_ms(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n != -1 || (errno() != libc::EAGAIN && errno() != libc::EWOULDBLOCK) {
            return n;
        }

        // Would block: park until the reactor sees the descriptor
        // ready or the deadline fires.
        let iom = IoManager::current().expect("hooked I/O outside an I/O manager thread");

        let timer = if timeout_ms != NO_TIMEOUT {
            let witness = Arc::downgrade(&tinfo);
            let cond = witness.clone();
            let iow = Arc::downgrade(&iom);
            Some(iom.timers().add_conditional(
                timeout_ms,
                move || {
                    let Some(t) = cond.upgrade() else { return };
                    if t.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(io) = iow.upgrade() {
                        io.cancel_event(fd, event);
                    }
                },
                witness,
                false,
            ))
        } else {
            None
        };

        if let Err(err) = iom.add_event(fd, event, None) {
            tracing::error!(call = name, fd, ?event, %err, "event registration failed");
            if let Some(t) = timer {
                t.cancel();
            }
            return -1;
        }

        Coroutine::yield_to_hold();

        if let Some(t) = timer {
            t.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Woken by the event: the descriptor is ready, go again.
    }
}

// ── Sleep family ────────────────────────────────────────────────────
//
// Never calls the raw blocking sleep on a hooked thread: a one-shot
// timer re-schedules the calling coroutine and the worker keeps
// running other tasks.

pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        // SAFETY: plain libc call.
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: c_uint) -> c_int {
    if !is_hook_enabled() {
        // SAFETY: plain libc call.
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

/// # Safety
///
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    let req = &*req;
    sleep_ms(req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000);
    0
}

fn sleep_ms(ms: u64) {
    let iom = IoManager::current().expect("hooked sleep outside an I/O manager thread");
    let co = Coroutine::current();
    let sched = iom.scheduler();
    iom.timers().add_timer(
        ms,
        move || {
            sched.schedule(co.clone());
        },
        false,
    );
    Coroutine::yield_to_hold();
}

// ── Socket lifecycle ────────────────────────────────────────────────

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    // SAFETY: plain libc call.
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_hook_enabled() || fd == -1 {
        return fd;
    }
    // Registration forces kernel-level O_NONBLOCK while the user keeps
    // seeing a blocking socket.
    registry().ensure(fd);
    fd
}

/// Hooked connect with an explicit deadline, independent of any
/// timeout stored on the descriptor. `NO_TIMEOUT` waits forever.
///
/// # Safety
///
/// `addr` must point to `addrlen` valid bytes of socket address.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(meta) = registry().get(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if meta.user_nonblock() || !meta.is_socket() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: wait for writability, then read the socket error.
    let iom = IoManager::current().expect("hooked connect outside an I/O manager thread");
    let tinfo = Arc::new(TimerInfo::default());

    let timer = if timeout_ms != NO_TIMEOUT {
        let witness = Arc::downgrade(&tinfo);
        let cond = witness.clone();
        let iow = Arc::downgrade(&iom);
        Some(iom.timers().add_conditional(
            timeout_ms,
            move || {
                let Some(t) = cond.upgrade() else { return };
                if t.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(io) = iow.upgrade() {
                    io.cancel_event(fd, EventSet::WRITE);
                }
            },
            witness,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, EventSet::WRITE, None) {
        Ok(()) => {
            Coroutine::yield_to_hold();
            if let Some(t) = timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(t) = timer {
                t.cancel();
            }
            tracing::error!(fd, %err, "connect event registration failed");
        }
    }

    let mut sock_err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut sock_err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if sock_err == 0 {
        0
    } else {
        set_errno(sock_err);
        -1
    }
}

/// # Safety
///
/// As for [`connect_with_timeout`].
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, config::current().connect_timeout_ms)
}

/// # Safety
///
/// `addr`/`addrlen` follow the raw `accept` contract (both may be null).
pub unsafe fn accept(s: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(s, "accept", EventSet::READ, libc::SO_RCVTIMEO, || {
        libc::accept(s, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 {
        registry().ensure(fd);
    }
    fd
}

// ── Read family ─────────────────────────────────────────────────────

/// # Safety
///
/// `buf` must be valid for `count` writable bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", EventSet::READ, libc::SO_RCVTIMEO, || {
        libc::read(fd, buf, count)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", EventSet::READ, libc::SO_RCVTIMEO, || {
        libc::readv(fd, iov, iovcnt)
    })
}

/// # Safety
///
/// `buf` must be valid for `len` writable bytes.
pub unsafe fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", EventSet::READ, libc::SO_RCVTIMEO, || {
        libc::recv(sockfd, buf, len, flags)
    })
}

/// # Safety
///
/// Raw `recvfrom` contract.
pub unsafe fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", EventSet::READ, libc::SO_RCVTIMEO, || {
        libc::recvfrom(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", EventSet::READ, libc::SO_RCVTIMEO, || {
        libc::recvmsg(sockfd, msg, flags)
    })
}

// ── Write family ────────────────────────────────────────────────────

/// # Safety
///
/// `buf` must be valid for `count` readable bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", EventSet::WRITE, libc::SO_SNDTIMEO, || {
        libc::write(fd, buf, count)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", EventSet::WRITE, libc::SO_SNDTIMEO, || {
        libc::writev(fd, iov, iovcnt)
    })
}

/// # Safety
///
/// `msg` must be valid for `len` readable bytes.
pub unsafe fn send(s: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(s, "send", EventSet::WRITE, libc::SO_SNDTIMEO, || {
        libc::send(s, msg, len, flags)
    })
}

/// # Safety
///
/// Raw `sendto` contract.
pub unsafe fn sendto(
    s: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(s, "sendto", EventSet::WRITE, libc::SO_SNDTIMEO, || {
        libc::sendto(s, msg, len, flags, to, tolen)
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(s: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(s, "sendmsg", EventSet::WRITE, libc::SO_SNDTIMEO, || {
        libc::sendmsg(s, msg, flags)
    })
}

/// Send an entire buffer, retrying partial writes. Returns the byte
/// count on success or -1 with errno from the failing `send`.
///
/// # Safety
///
/// `buf` must be valid for `len` readable bytes.
pub unsafe fn send_all(s: c_int, buf: *const c_void, len: size_t) -> ssize_t {
    let mut sent = 0usize;
    while sent < len {
        let n = send(s, (buf as *const u8).add(sent) as *const c_void, len - sent, 0);
        if n < 0 {
            return n;
        }
        if n == 0 {
            break;
        }
        sent += n as usize;
    }
    sent as ssize_t
}

// ── Descriptor bookkeeping ──────────────────────────────────────────

/// Cancels every registered event on the descriptor (firing their
/// continuations) and forgets its metadata before closing.
pub fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        // SAFETY: plain libc call.
        return unsafe { libc::close(fd) };
    }
    if registry().get(fd).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        registry().remove(fd);
    }
    // SAFETY: plain libc call.
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl`. The optional argument is passed as a word, the way
/// the kernel receives it; commands taking a pointer get it cast back.
///
/// `F_SETFL` stores the user's O_NONBLOCK intention separately from
/// the kernel-forced flag; `F_GETFL` answers from the user's
/// perspective.
///
/// # Safety
///
/// For pointer-taking commands, `arg` must be a valid pointer of the
/// command's type.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            let Some(meta) = registry().get(fd) else {
                return libc::fcntl(fd, cmd, flags);
            };
            if meta.is_closed() || !meta.is_socket() {
                return libc::fcntl(fd, cmd, flags);
            }
            meta.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if meta.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            libc::fcntl(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, cmd);
            let Some(meta) = registry().get(fd) else {
                return flags;
            };
            if meta.is_closed() || !meta.is_socket() {
                return flags;
            }
            if meta.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETOWN
        | F_SETSIG
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => libc::fcntl(fd, cmd, arg as c_int),
        libc::F_GETFD
        | libc::F_GETOWN
        | F_GETSIG
        | libc::F_GETLEASE
        | libc::F_GETPIPE_SZ => libc::fcntl(fd, cmd),
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK => {
            libc::fcntl(fd, cmd, arg as *mut libc::flock)
        }
        F_GETOWN_EX | F_SETOWN_EX => {
            libc::fcntl(fd, cmd, arg as *mut f_owner_ex)
        }
        _ => libc::fcntl(fd, cmd),
    }
}

/// Hooked `ioctl`; `FIONBIO` updates the user-visible non-block flag.
///
/// # Safety
///
/// `arg` must be valid for the request.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(meta) = registry().get(fd) {
            if !meta.is_closed() && meta.is_socket() {
                meta.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Pass-through; present so call sites can stay on the hooked surface.
///
/// # Safety
///
/// Raw `getsockopt` contract.
pub unsafe fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(sockfd, level, optname, optval, optlen)
}

/// Hooked `setsockopt`; SO_RCVTIMEO / SO_SNDTIMEO are mirrored into
/// the descriptor metadata so later hooked reads and writes honor
/// them. A zero timeval means "no timeout", matching POSIX.
///
/// # Safety
///
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(meta) = registry().get(sockfd) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            meta.set_timeout_ms(optname, if ms == 0 { NO_TIMEOUT } else { ms });
        }
    }
    libc::setsockopt(sockfd, level, optname, optval, optlen)
}
