//! Runtime configuration
//!
//! Compile-time defaults with `STRAND_*` environment overrides:
//!
//! - `STRAND_STACK_SIZE` — default coroutine stack bytes
//! - `STRAND_CONNECT_TIMEOUT_MS` — default deadline for hooked `connect`
//! - `STRAND_EPOLL_WAIT_MAX_MS` — upper bound on one `epoll_wait` sleep
//!
//! The process-wide settings are read through [`current`] and can be
//! replaced wholesale with [`install`] before any I/O manager starts.

use std::sync::OnceLock;

use parking_lot::RwLock;
use strand_core::env::env_get;
use strand_core::error::{RuntimeError, RuntimeResult};

pub mod defaults {
    /// 128 KiB stacks.
    pub const STACK_SIZE: usize = 128 * 1024;
    /// 5 s connect deadline.
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;
    /// 3 s epoll_wait clamp.
    pub const EPOLL_WAIT_MAX_MS: u64 = 3000;
}

/// Settings the core reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Default stack bytes for spawned coroutines.
    pub stack_size: usize,
    /// Default deadline for the hooked `connect`.
    pub connect_timeout_ms: u64,
    /// Upper bound on a single `epoll_wait` sleep.
    pub epoll_wait_max_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment lookup.
    pub const fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            epoll_wait_max_ms: defaults::EPOLL_WAIT_MAX_MS,
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            connect_timeout_ms: env_get("STRAND_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            epoll_wait_max_ms: env_get("STRAND_EPOLL_WAIT_MAX_MS", defaults::EPOLL_WAIT_MAX_MS),
        }
    }

    // Builder methods

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn epoll_wait_max_ms(mut self, ms: u64) -> Self {
        self.epoll_wait_max_ms = ms;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("stack_size must be >= 16 KiB"));
        }
        if self.epoll_wait_max_ms == 0 {
            return Err(RuntimeError::InvalidConfig("epoll_wait_max_ms must be > 0"));
        }
        Ok(())
    }
}

fn slot() -> &'static RwLock<RuntimeConfig> {
    static CONFIG: OnceLock<RwLock<RuntimeConfig>> = OnceLock::new();
    CONFIG.get_or_init(|| RwLock::new(RuntimeConfig::from_env()))
}

/// Snapshot of the process-wide settings.
pub fn current() -> RuntimeConfig {
    slot().read().clone()
}

/// Replace the process-wide settings.
///
/// Takes effect for coroutines spawned and waits started after the
/// call; already-parked waits keep the clamp they were started with.
pub fn install(config: RuntimeConfig) -> RuntimeResult<()> {
    config.validate()?;
    *slot().write() = config;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::new();
        assert_eq!(c.stack_size, 128 * 1024);
        assert_eq!(c.connect_timeout_ms, 5000);
        assert_eq!(c.epoll_wait_max_ms, 3000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let c = RuntimeConfig::new()
            .stack_size(256 * 1024)
            .connect_timeout_ms(200)
            .epoll_wait_max_ms(50);
        assert_eq!(c.stack_size, 256 * 1024);
        assert_eq!(c.connect_timeout_ms, 200);
        assert_eq!(c.epoll_wait_max_ms, 50);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new()
            .epoll_wait_max_ms(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("STRAND_STACK_SIZE", "262144");
        let c = RuntimeConfig::from_env();
        assert_eq!(c.stack_size, 262144);
        std::env::remove_var("STRAND_STACK_SIZE");
    }

    #[test]
    fn test_install_rejects_invalid() {
        assert!(install(RuntimeConfig::new().stack_size(1)).is_err());
    }
}
