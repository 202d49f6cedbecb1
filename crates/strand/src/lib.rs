//! # strand — stackful coroutines over epoll
//!
//! An M:N coroutine runtime for servers: worker threads multiplex a
//! FIFO queue of stackful coroutines, idle workers park in `epoll_wait`
//! bounded by the earliest timer deadline, and a hooked syscall surface
//! turns apparently blocking socket I/O into coroutine suspension.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{IoManager, Task, hook};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "app");
//!
//!     iom.schedule(Task::call(|| {
//!         // Looks blocking; parks only this coroutine.
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // ... hook::connect / hook::recv / hook::send ...
//!         hook::close(fd);
//!     }));
//!
//!     iom.add_timer(1000, || println!("tick"), true);
//!     // ...
//!     iom.stop();
//! }
//! ```

pub use strand_core::{
    env_get, env_get_opt, CoId, CoState, EnvParse, RuntimeError, RuntimeResult,
};

pub use strand_runtime::{
    config, hook, CoFn, Coroutine, Dispatch, EventSet, IoManager, RuntimeConfig, Scheduler, Task,
    Timer, TimerFn, TimerManager, Work,
};
