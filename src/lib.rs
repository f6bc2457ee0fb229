//! Cooperative multitasking for Rust: stackful coroutines (fibers)
//! multiplexed over a pool of worker threads by an M:N work-queue
//! scheduler.
//!
//! This library contains:
//!
//! - [Fibers](fiber): explicitly scheduled coroutines with their own
//!   stacks, resumed and yielded in user space
//! - [Scheduler](scheduler): worker threads driving a shared FIFO task
//!   queue, with optional participation of the constructing thread
//!   ("caller mode") and per-task thread affinity
//! - [Logging](mod@log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//! - [Syscall-hook flag](hook) and [introspection helpers](util) for the
//!   layers built on top
//!
//! Within one thread scheduling is purely cooperative: control moves
//! only at [`fiber::yield_now`] and when a fiber's callable returns.
//! Across threads the scheduler provides true parallelism, handing
//! fibers over through its queue so that a fiber runs on at most one
//! thread at a time.
//!
//! # Example
//!
//! ```no_run
//! use strand::scheduler::{Scheduler, Task};
//!
//! let sched = Scheduler::new(4, false, "pool");
//! sched.start().unwrap();
//! sched.schedule(Task::call(|| println!("hi from a fiber"))).unwrap();
//! sched.stop();
//! ```
mod context;
pub mod error;
pub mod fiber;
pub mod hook;
pub mod log;
pub mod scheduler;
pub mod util;

pub use error::Result;
pub use fiber::Fiber;
pub use scheduler::{Scheduler, Task};

pub type StdResult<T, E> = std::result::Result<T, E>;
