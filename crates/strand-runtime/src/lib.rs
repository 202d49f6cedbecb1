//! # strand-runtime — stackful coroutine server runtime
//!
//! A user-space coroutine scheduler fused with an epoll reactor and a
//! deadline timer set, plus a syscall-shaped blocking-I/O layer that
//! suspends the calling coroutine instead of the OS thread.
//!
//! ## Architecture
//!
//! ```text
//!                      user code / servers
//!                │ schedule()        │ hook::read() ...
//!                ▼                   ▼
//! ┌──────────────────────┐   ┌───────────────────┐
//! │      Scheduler       │   │    Hook layer     │
//! │ N workers × FIFO     │◄──│ EAGAIN → register │
//! │ queue of coroutines  │   │ event + yield     │
//! └──────────┬───────────┘   └─────────┬─────────┘
//!            │ idle                    │ add_event / timers
//!            ▼                         ▼
//! ┌─────────────────────────────────────────────┐
//! │                  IoManager                  │
//! │  epoll_wait bounded by earliest deadline    │
//! │  fd → (read ctx, write ctx)   self-pipe     │
//! └──────────────────────┬──────────────────────┘
//!                        │ swap_in / swap_out
//!                        ▼
//! ┌─────────────────────────────────────────────┐
//! │   Coroutine: mmap'd stack + SavedRegs       │
//! │   naked-asm switch (x86_64 / aarch64)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Within a thread the model is cooperative: a task runs until it
//! finishes, yields explicitly, or enters a hooked call that takes the
//! slow path. CPU-bound work does not preempt.

pub mod arch;
pub(crate) mod clock;
pub mod config;
pub mod coroutine;
pub mod fdmeta;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;
pub(crate) mod util;

pub use config::RuntimeConfig;
pub use strand_core::{CoId, CoState};
pub use coroutine::{CoFn, Coroutine};
pub use io::{EventSet, IoManager};
pub use scheduler::{Dispatch, Scheduler, Task, Work};
pub use timer::{Timer, TimerFn, TimerManager};
