//! At-most-once work queue over a store list.
//!
//! Producers push serialized [`Task`]s onto the head of a list; consumers
//! take them from the tail with a blocking pop. The pop is atomic and
//! destructive, so each task reaches exactly one consumer. With a single
//! consumer tasks are processed in enqueue order; with several, each one
//! takes whatever is at the tail when it polls.

mod consumer;
mod handler;
mod pool;
mod producer;
mod task;

pub use consumer::{Consumer, ConsumerStats, IdlePolicy};
pub use handler::{LoggingHandler, TaskHandler};
pub use pool::ConsumerPool;
pub use producer::Producer;
pub use task::Task;
