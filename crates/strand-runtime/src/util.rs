//! Small OS helpers shared across the runtime.

/// Kernel thread id of the calling thread.
///
/// Task affinity hints are expressed in these ids; -1 means "any
/// worker".
#[inline]
pub fn thread_id() -> i64 {
    // SAFETY: gettid has no failure modes.
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable_and_distinct() {
        let here = thread_id();
        assert!(here > 0);
        assert_eq!(here, thread_id());

        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, other);
    }
}
