//! Execution core of the shoal cluster rebalancer.
//!
//! Given a batch of execution proposals, each describing a change to a
//! partition's replica set, its per-broker disk placement, or its
//! preferred leader, the [`Executor`] drives those proposals to completion
//! against the cluster's admin interface. Movement happens in three
//! strictly ordered phases (inter-broker replicas, intra-broker disks,
//! leadership) on a dedicated worker that polls cluster metadata between
//! batches. Per-broker and cluster-wide concurrency caps bound how much
//! moves at once; an AIMD feedback loop adapts those caps to
//! (At/Under)MinISR health and broker load, and a single stop signal
//! provides safe cancellation with rollback of in-flight inter-broker
//! reassignments.
//!
//! Proposal generation, the request surface, and metric plumbing live
//! elsewhere; they reach this crate through the collaborator traits in
//! [`admin`], [`cluster`], [`monitor`], and [`hooks`].

pub mod admin;
pub mod adjuster;
pub mod cluster;
pub mod concurrency;
pub mod config;
pub mod error;
mod execution_loop;
pub mod executor;
pub mod history;
pub mod hooks;
pub mod min_isr_cache;
pub mod monitor;
pub mod state;
pub mod strategy;
pub mod task;
pub mod throttle;
pub mod tracker;

pub use crate::cluster::{BrokerId, ClusterSnapshot, TopicPartition};
pub use crate::concurrency::ConcurrencyType;
pub use crate::config::ExecutorConfig;
pub use crate::error::{ExecutorError, ExecutorResult};
pub use crate::executor::{DemotionRequest, ExecutionRequest, Executor, ReasonSupplier};
pub use crate::state::{ExecutorPhase, ExecutorState};
pub use crate::task::{ExecutionProposal, ExecutionTask, TaskState, TaskType};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
