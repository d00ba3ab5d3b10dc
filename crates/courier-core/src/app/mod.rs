//! Application layer: ports wired into producer and consumer.
//!
//! - **registry**: job kind -> handler, checked at startup
//! - **producer**: `enqueue` / `enqueue_job`
//! - **worker_pool**: claim -> handle -> ack / requeue / fail
//! - **reaper**: reclaims expired leases

pub mod producer;
pub mod reaper;
pub mod registry;
pub mod worker_pool;

pub use self::producer::Producer;
pub use self::reaper::Reaper;
pub use self::registry::{DynHandler, Handler, HandlerRegistry, Job, RegistryBuilder, TypedHandler};
pub use self::worker_pool::{AttemptOutcome, Worker, WorkerPool, WorkerPoolHandle};
