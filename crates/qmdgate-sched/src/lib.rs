//! # qmdgate-sched
//!
//! Background maintenance around the gateway:
//!
//! - [`Scheduler`]: periodic reindex / embed / cache-cleanup tasks with
//!   single-flight and quadratic-backoff retry
//! - [`Guardian`]: sidecar health checking with bounded restart attempts
//! - [`Heartbeat`]: named component checkers feeding the health RPC

pub mod guardian;
pub mod heartbeat;
pub mod scheduler;

pub use guardian::Guardian;
pub use heartbeat::{Heartbeat, SelfHealer};
pub use scheduler::{Scheduler, SchedulerIntervals};
