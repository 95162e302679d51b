//! Queueing and resource allocation.
//!
//! - [`JobStore`] owns job records and their payloads.
//! - [`ResourcePool`] owns the exclusive execution targets and their leases.
//! - [`WorkQueue`] holds queued job ids in arrival order.
//! - [`Dispatcher`] owns the queue and the pool and matches one to the other
//!   whenever a job is submitted or finishes.

pub mod dispatcher;
pub mod job;
pub mod pool;
pub mod queue;
pub mod store;

pub use dispatcher::{
    DispatchMessage, Dispatcher, DispatcherHandle, JobView, Placement, QueueMode, QueueSnapshot,
};
pub use job::{Job, JobStatus, JobUpdate, PayloadRef, ResourceClass};
pub use pool::{AllocationPolicy, ResourcePool, ResourceSpec};
pub use queue::{QueueEntry, WorkQueue};
pub use store::JobStore;
