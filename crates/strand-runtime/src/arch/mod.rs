//! Architecture-specific context switching
//!
//! A context switch here is synchronous and voluntary: it saves the
//! callee-saved register file plus stack pointer into the suspended
//! coroutine's save area and restores the target's, leaving the
//! suspended stack untouched until resumed. Caller-saved registers are
//! dead across the call boundary by the C ABI, so only the callee-saved
//! set is stored.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{init_context, switch_context, SavedRegs};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{init_context, switch_context, SavedRegs};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("strand-runtime supports x86_64 and aarch64 only");
