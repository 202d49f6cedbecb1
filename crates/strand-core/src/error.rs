//! Error types for the strand runtime
//!
//! Only structured, recoverable failures get a variant here. Programming
//! errors (destroying a running coroutine, duplicate event registration,
//! switching into an executing coroutine) abort with a diagnostic instead
//! of returning an error, and I/O results observed by the hook layer stay
//! POSIX-shaped (return value + errno).

use thiserror::Error;

/// Result type for runtime lifecycle operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from runtime lifecycle and configuration.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The scheduler was started twice.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// An operation that needs a running scheduler found none.
    #[error("scheduler is not running")]
    NotRunning,

    /// A kernel resource could not be acquired; errno preserved.
    #[error("{what} failed")]
    Resource {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Wrap the current `errno` as a resource error.
    pub fn last_os_error(what: &'static str) -> RuntimeError {
        RuntimeError::Resource {
            what,
            source: std::io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = RuntimeError::InvalidConfig("stack_size must be >= 16 KiB");
        assert_eq!(
            e.to_string(),
            "invalid configuration: stack_size must be >= 16 KiB"
        );
    }

    #[test]
    fn test_resource_preserves_errno() {
        let e = RuntimeError::Resource {
            what: "epoll_create1",
            source: std::io::Error::from_raw_os_error(libc_emfile()),
        };
        let src = std::error::Error::source(&e).unwrap();
        let io = src.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.raw_os_error(), Some(libc_emfile()));
    }

    fn libc_emfile() -> i32 {
        24 // EMFILE
    }
}
