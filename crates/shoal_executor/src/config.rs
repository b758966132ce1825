//! Executor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adjuster::MetricLimits;

/// Configuration for the execution core.
///
/// Per-dimension AIMD bounds live as compile-time tables on
/// [`crate::concurrency::ConcurrencyType`]; everything tunable at deploy
/// time is here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default interval between execution progress checks. Clamped at
    /// runtime into `[min_execution_progress_check_interval, requested-or-default]`.
    pub execution_progress_check_interval: Duration,
    /// Hard floor for the progress check interval.
    pub min_execution_progress_check_interval: Duration,
    /// Per-task deadline for a leadership movement.
    pub leader_movement_timeout: Duration,
    /// How long a broker stays in the recently-demoted set.
    pub demotion_history_retention: Duration,
    /// How long a broker stays in the recently-removed set.
    pub removal_history_retention: Duration,
    /// Period of the history expiry scanner.
    pub history_scanner_period: Duration,
    /// Interval of one full concurrency-adjuster cycle; the tick period is
    /// this divided by `concurrency_adjuster_num_min_isr_checks`.
    pub concurrency_adjuster_interval: Duration,
    /// Number of MinISR-based checks per metric-based check.
    pub concurrency_adjuster_num_min_isr_checks: u32,
    /// Enable AIMD adjustment of inter-broker replica movement concurrency.
    pub concurrency_adjuster_inter_broker_enabled: bool,
    /// Enable AIMD adjustment of per-broker leadership movement concurrency.
    pub concurrency_adjuster_leadership_broker_enabled: bool,
    /// Enable AIMD adjustment of cluster-wide leadership movement concurrency.
    pub concurrency_adjuster_leadership_cluster_enabled: bool,
    /// Enable the (At/Under)MinISR-driven adjustment path.
    pub concurrency_adjuster_min_isr_check_enabled: bool,
    /// Broker metric ceilings for the metric-based adjustment path.
    pub metric_limits: MetricLimits,
    /// Upper bound on cached per-topic MinISR entries.
    pub min_isr_cache_size: usize,
    /// How long a cached MinISR entry stays valid.
    pub min_isr_cache_retention: Duration,
    /// Period of the MinISR cache cleaner.
    pub min_isr_cache_cleaner_period: Duration,
    /// Minimum gap between two slow-task alerts.
    pub slow_task_alerting_backoff: Duration,
    /// A non-terminal task older than this is reported as slow.
    pub task_execution_alerting_threshold: Duration,
    /// Default number of concurrent inter-broker replica movements per broker.
    pub default_inter_broker_concurrency: u32,
    /// Default number of concurrent intra-broker disk movements per broker.
    pub default_intra_broker_concurrency: u32,
    /// Default number of concurrent leadership movements per broker.
    pub default_broker_leadership_concurrency: u32,
    /// Default number of concurrent leadership movements in the cluster.
    pub default_cluster_leadership_concurrency: u32,
    /// Timeout for load-monitor metadata queries.
    pub metadata_wait_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            execution_progress_check_interval: Duration::from_secs(10),
            min_execution_progress_check_interval: Duration::from_secs(5),
            leader_movement_timeout: Duration::from_secs(180),
            demotion_history_retention: Duration::from_secs(14 * 24 * 3600),
            removal_history_retention: Duration::from_secs(14 * 24 * 3600),
            history_scanner_period: Duration::from_secs(5),
            concurrency_adjuster_interval: Duration::from_secs(180),
            concurrency_adjuster_num_min_isr_checks: 3,
            concurrency_adjuster_inter_broker_enabled: false,
            concurrency_adjuster_leadership_broker_enabled: false,
            concurrency_adjuster_leadership_cluster_enabled: false,
            concurrency_adjuster_min_isr_check_enabled: true,
            metric_limits: MetricLimits::default(),
            min_isr_cache_size: 2000,
            min_isr_cache_retention: Duration::from_secs(3600),
            min_isr_cache_cleaner_period: Duration::from_secs(300),
            slow_task_alerting_backoff: Duration::from_secs(60),
            task_execution_alerting_threshold: Duration::from_secs(90),
            default_inter_broker_concurrency: 5,
            default_intra_broker_concurrency: 2,
            default_broker_leadership_concurrency: 250,
            default_cluster_leadership_concurrency: 1000,
            metadata_wait_timeout: Duration::from_secs(10),
        }
    }
}
