//! Load-monitor seam: broker liveness, metric values, sampling control.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::{BrokerId, ClusterSnapshot};

/// What the metric sampler collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    /// Partition and broker metrics.
    All,
    /// Broker metrics only, while an execution is rewriting placement.
    OngoingExecution,
}

/// Point-in-time metric values for one broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerMetricValues {
    pub cpu_util_percent: f64,
    pub log_flush_time_ms: f64,
    pub request_queue_size: f64,
    pub produce_local_time_ms: f64,
    pub fetch_local_time_ms: f64,
}

/// Access to the monitored view of the cluster.
#[async_trait]
pub trait LoadMonitor: Send + Sync {
    /// Brokers that currently host at least one replica.
    async fn brokers_with_replicas(&self, timeout: Duration) -> anyhow::Result<BTreeSet<BrokerId>>;

    /// Dead brokers that still host at least one replica.
    async fn dead_brokers_with_replicas(
        &self,
        timeout: Duration,
    ) -> anyhow::Result<BTreeSet<BrokerId>>;

    /// The monitor's cached view of the cluster.
    fn cluster(&self) -> ClusterSnapshot;

    /// Latest metric values per broker.
    fn current_broker_metrics(&self) -> BTreeMap<BrokerId, BrokerMetricValues>;

    fn sampling_mode(&self) -> SamplingMode;

    fn set_sampling_mode(&self, mode: SamplingMode);

    /// Pause metric sampling. Fails when the monitor is not in a state that
    /// allows pausing; callers retry.
    fn pause_metric_sampling(&self, reason: &str, force: bool) -> anyhow::Result<()>;

    fn resume_metric_sampling(&self, reason: &str);
}
