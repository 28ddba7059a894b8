//! Fixed-size async worker pool.
//!
//! A set of worker loops pull [`Task`]s from a shared queue and run one
//! caller-supplied handler on each. Results travel back through a per-task
//! [`Completion`].
//!
//! # Features
//! - Non-blocking submission, unbounded or bounded queue with an overflow policy
//! - Per-task panic isolation and optional handler timeout
//! - Graceful shutdown and join
//!
//! # Example
//! ```
//! use async_workerpool::{must, Options, Pool, Task};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pool: Pool<u64, u64> = must(Pool::new(
//!     Options::new()
//!         .workers(4)
//!         .handler(|task: Task<u64, u64>| async move {
//!             let n = task.input;
//!             task.respond(n * n);
//!         }),
//! ));
//!
//! let (task, done) = Task::new(7);
//! pool.add(task).unwrap();
//! assert_eq!(done.await, Ok(49));
//! pool.shutdown().await;
//! # }
//! ```

pub mod errors;
pub mod handle;
pub mod pool;
pub mod result;
pub mod task;

pub use errors::{PoolError, TaskError};
pub use handle::Completion;
pub use pool::{must, Config, Options, Overflow, Pool, DEFAULT_WORKERS};
pub use result::TaskResult;
pub use task::{Blocking, Responder, Task, TaskFunc};
