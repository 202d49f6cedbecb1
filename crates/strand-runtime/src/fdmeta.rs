//! Per-descriptor metadata for the hook layer
//!
//! The hook layer decides per descriptor whether a call can take the
//! suspend/wake path: only sockets that the user still believes are
//! blocking qualify. For those, the kernel-level O_NONBLOCK is forced
//! at registration so the raw syscall can never block a worker, while
//! `fcntl`/`ioctl` keep answering from the user's perspective.
//!
//! Metadata is created only by the hooked `socket()` / `accept()`
//! paths (or explicitly via [`FdRegistry::ensure`]); descriptors
//! obtained some other way always take the raw path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::c_int;
use parking_lot::RwLock;

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Metadata for one file descriptor.
pub struct FdMeta {
    fd: c_int,
    is_socket: bool,
    /// O_NONBLOCK forced at the kernel level by the runtime.
    sys_nonblock: AtomicBool,
    /// O_NONBLOCK as far as the user is concerned.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdMeta {
    fn new(fd: c_int) -> FdMeta {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: st is valid storage for fstat's out-parameter.
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let meta = FdMeta {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };

        if is_socket {
            // SAFETY: plain fcntl on a descriptor we just fstat'ed.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            meta.sys_nonblock.store(true, Ordering::SeqCst);
        }
        meta
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::SeqCst);
    }

    /// Timeout for one direction, keyed the way `setsockopt` keys it.
    pub fn timeout_ms(&self, kind: c_int) -> u64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::SeqCst)
        } else {
            self.send_timeout_ms.load(Ordering::SeqCst)
        }
    }

    pub fn set_timeout_ms(&self, kind: c_int, ms: u64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::SeqCst);
        } else {
            self.send_timeout_ms.store(ms, Ordering::SeqCst);
        }
    }
}

/// Lazily grown table of fd metadata.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

/// The process-wide registry.
pub fn registry() -> &'static FdRegistry {
    static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| FdRegistry {
        slots: RwLock::new(vec![None; 64]),
    })
}

impl FdRegistry {
    /// Look up metadata without creating it.
    pub fn get(&self, fd: c_int) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read();
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    /// Look up metadata, creating it on first sight of this fd. The
    /// explicit entry point for descriptors that did not come from the
    /// hooked `socket()` / `accept()` (e.g. `socketpair`, `dup`).
    pub fn ensure(&self, fd: c_int) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        if let Some(meta) = self.get(fd) {
            return Some(meta);
        }
        let mut slots = self.slots.write();
        let idx = fd as usize;
        if idx >= slots.len() {
            let grown = (idx + 1) * 3 / 2;
            slots.resize(grown, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdMeta::new(fd)));
        }
        slots[idx].clone()
    }

    /// Forget a descriptor; called by the hooked `close()`.
    pub fn remove(&self, fd: c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_socket() -> c_int {
        // SAFETY: plain socket creation.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_socket_detected_and_forced_nonblock() {
        let fd = raw_socket();
        let meta = registry().ensure(fd).unwrap();
        assert!(meta.is_socket());
        assert!(meta.sys_nonblock());
        assert!(!meta.user_nonblock());

        // The kernel-level flag really is set.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        registry().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_left_alone() {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let meta = registry().ensure(fds[0]).unwrap();
        assert!(!meta.is_socket());
        assert!(!meta.sys_nonblock());

        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK == 0);

        registry().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_get_does_not_create() {
        let fd = raw_socket();
        assert!(registry().get(fd).is_none());
        registry().ensure(fd);
        assert!(registry().get(fd).is_some());
        registry().remove(fd);
        assert!(registry().get(fd).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeouts_per_direction() {
        let fd = raw_socket();
        let meta = registry().ensure(fd).unwrap();
        assert_eq!(meta.timeout_ms(libc::SO_RCVTIMEO), NO_TIMEOUT);
        meta.set_timeout_ms(libc::SO_RCVTIMEO, 250);
        meta.set_timeout_ms(libc::SO_SNDTIMEO, 500);
        assert_eq!(meta.timeout_ms(libc::SO_RCVTIMEO), 250);
        assert_eq!(meta.timeout_ms(libc::SO_SNDTIMEO), 500);
        registry().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_negative_fd_rejected() {
        assert!(registry().get(-1).is_none());
        assert!(registry().ensure(-1).is_none());
    }
}
