//! Domain model (ids, kinds, job records, retry decisions, errors).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod kind;
pub mod record;
pub mod status;

pub use decision::{Decision, RetryPolicy};
pub use errors::{ErrorKind, QueueError, QueueResult};
pub use ids::{JobId, WorkerId};
pub use kind::JobKind;
pub use record::{FailureReason, JobFailure, JobRecord, Lease, deadline_after};
pub use status::JobStatus;
