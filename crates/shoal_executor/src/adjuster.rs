//! AIMD feedback control of movement concurrency.
//!
//! Each tick evaluates (At/Under)MinISR health first; broker metrics are
//! consulted only every `concurrency_adjuster_num_min_isr_checks` ticks and
//! only when the ISR check recommended no change. ISR health can recommend
//! stopping the execution or decreasing concurrency, never increasing it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{BrokerId, ClusterSnapshot};
use crate::concurrency::{decreased_cap, increased_cap, ConcurrencyManager, ConcurrencyType};
use crate::executor::ExecutorCore;
use crate::min_isr_cache::MinIsrWithTime;
use crate::monitor::{BrokerMetricValues, LoadMonitor};
use crate::now_ms;
use crate::state::ExecutorPhase;

/// Number of Under-MinISR partitions at which the adjuster recommends
/// stopping the execution outright.
pub const UNDER_MIN_ISR_STOP_THRESHOLD: usize = 1;

/// Broker metric ceilings used by the metric-based adjustment path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricLimits {
    pub max_cpu_util_percent: f64,
    pub max_log_flush_time_ms: f64,
    pub max_request_queue_size: f64,
    pub max_produce_local_time_ms: f64,
    pub max_fetch_local_time_ms: f64,
}

impl Default for MetricLimits {
    fn default() -> Self {
        Self {
            max_cpu_util_percent: 90.0,
            max_log_flush_time_ms: 1000.0,
            max_request_queue_size: 1000.0,
            max_produce_local_time_ms: 1000.0,
            max_fetch_local_time_ms: 500.0,
        }
    }
}

impl MetricLimits {
    fn over_limit(&self, values: &BrokerMetricValues) -> bool {
        values.cpu_util_percent > self.max_cpu_util_percent
            || values.log_flush_time_ms > self.max_log_flush_time_ms
            || values.request_queue_size > self.max_request_queue_size
            || values.produce_local_time_ms > self.max_produce_local_time_ms
            || values.fetch_local_time_ms > self.max_fetch_local_time_ms
    }
}

/// Outcome of one recommendation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcurrencyRecommendation {
    pub stop_execution: bool,
    pub brokers_to_increase: BTreeSet<BrokerId>,
    pub brokers_to_decrease: BTreeSet<BrokerId>,
    pub increase_cluster_leadership: bool,
    pub decrease_cluster_leadership: bool,
}

impl ConcurrencyRecommendation {
    pub fn no_change() -> Self {
        Self::default()
    }

    pub fn is_no_change(&self) -> bool {
        *self == Self::default()
    }
}

/// Recommend concurrency changes from (At/Under)MinISR partition health.
///
/// A partition is Under-MinISR when its live in-sync replica count is below
/// the topic's configured minimum, At-MinISR when it is exactly at it.
pub fn recommend_from_min_isr(
    cluster: &ClusterSnapshot,
    min_isr_by_topic: &BTreeMap<String, MinIsrWithTime>,
) -> ConcurrencyRecommendation {
    let mut under_min_isr = 0usize;
    let mut reco = ConcurrencyRecommendation::no_change();

    for (tp, partition) in &cluster.partitions {
        let Some(entry) = min_isr_by_topic.get(&tp.topic) else {
            continue;
        };
        let live_isr: Vec<BrokerId> = partition
            .in_sync_replicas
            .iter()
            .copied()
            .filter(|b| cluster.brokers.contains_key(b))
            .collect();
        if (live_isr.len() as u32) < entry.min_isr {
            under_min_isr += 1;
        } else if live_isr.len() as u32 == entry.min_isr {
            reco.brokers_to_decrease.extend(live_isr);
        }
    }

    if under_min_isr >= UNDER_MIN_ISR_STOP_THRESHOLD {
        return ConcurrencyRecommendation {
            stop_execution: true,
            ..ConcurrencyRecommendation::no_change()
        };
    }
    reco
}

/// Recommend concurrency changes from broker metric values: any metric over
/// its ceiling recommends a decrease for that broker, a fully healthy
/// broker recommends an increase. The cluster-leadership recommendation
/// follows the aggregate.
pub fn recommend_from_metrics(
    metrics: &BTreeMap<BrokerId, BrokerMetricValues>,
    limits: &MetricLimits,
) -> ConcurrencyRecommendation {
    let mut reco = ConcurrencyRecommendation::no_change();
    for (broker, values) in metrics {
        if limits.over_limit(values) {
            reco.brokers_to_decrease.insert(*broker);
        } else {
            reco.brokers_to_increase.insert(*broker);
        }
    }
    reco.decrease_cluster_leadership = !reco.brokers_to_decrease.is_empty();
    reco.increase_cluster_leadership =
        reco.brokers_to_decrease.is_empty() && !reco.brokers_to_increase.is_empty();
    reco
}

/// Apply one AIMD step down to a broker cap; no-op at the dimension minimum.
pub fn decrease_broker_cap(
    concurrency: &ConcurrencyManager,
    broker: BrokerId,
    concurrency_type: ConcurrencyType,
) {
    let current = concurrency.broker_cap(broker, concurrency_type);
    let decreased = decreased_cap(concurrency_type, current);
    if decreased != current {
        concurrency.set_for_broker(broker, decreased, concurrency_type);
        tracing::info!(
            broker,
            concurrency = decreased,
            dimension = ?concurrency_type,
            "concurrency adjuster decreased movement concurrency"
        );
    }
}

/// Apply one AIMD step up to a broker cap; no-op at the dimension maximum.
pub fn increase_broker_cap(
    concurrency: &ConcurrencyManager,
    broker: BrokerId,
    concurrency_type: ConcurrencyType,
) {
    let current = concurrency.broker_cap(broker, concurrency_type);
    let increased = increased_cap(concurrency_type, current);
    if increased != current {
        concurrency.set_for_broker(broker, increased, concurrency_type);
        tracing::info!(
            broker,
            concurrency = increased,
            dimension = ?concurrency_type,
            "concurrency adjuster increased movement concurrency"
        );
    }
}

fn decrease_cluster_leadership_cap(concurrency: &ConcurrencyManager) {
    let t = ConcurrencyType::LeadershipCluster;
    let current = concurrency.cluster_leadership_cap();
    let decreased = decreased_cap(t, current);
    if decreased != current {
        concurrency.set_for_all_brokers_or_cluster(Some(decreased), t);
        tracing::info!(
            concurrency = decreased,
            "concurrency adjuster decreased cluster leadership movement concurrency"
        );
    }
}

fn increase_cluster_leadership_cap(concurrency: &ConcurrencyManager) {
    let t = ConcurrencyType::LeadershipCluster;
    let current = concurrency.cluster_leadership_cap();
    let increased = increased_cap(t, current);
    if increased != current {
        concurrency.set_for_all_brokers_or_cluster(Some(increased), t);
        tracing::info!(
            concurrency = increased,
            "concurrency adjuster increased cluster leadership movement concurrency"
        );
    }
}

/// Mutable adjuster state owned by the executor core.
#[derive(Default)]
pub(crate) struct AdjusterState {
    started: AtomicBool,
    num_checks: AtomicU64,
    load_monitor: RwLock<Option<Arc<dyn LoadMonitor>>>,
}

impl AdjusterState {
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn load_monitor(&self) -> Option<Arc<dyn LoadMonitor>> {
        self.load_monitor.read().unwrap().clone()
    }

    fn next_check_index(&self) -> u64 {
        self.num_checks.fetch_add(1, Ordering::AcqRel)
    }
}

/// Point the adjuster at the active load monitor and seed the concurrency
/// caps for the starting execution.
pub(crate) async fn init_adjustment(
    core: &ExecutorCore,
    load_monitor: Arc<dyn LoadMonitor>,
    requested: crate::concurrency::RequestedConcurrency,
) -> anyhow::Result<()> {
    let brokers = load_monitor
        .brokers_with_replicas(core.config.metadata_wait_timeout)
        .await?;
    core.concurrency.initialize(&brokers, requested);
    *core.adjuster.load_monitor.write().unwrap() = Some(load_monitor);
    core.adjuster.started.store(true, Ordering::Release);
    Ok(())
}

/// Reset the adjuster after an execution completes.
pub(crate) fn clear_adjustment(core: &ExecutorCore) {
    core.adjuster.started.store(false, Ordering::Release);
    *core.adjuster.load_monitor.write().unwrap() = None;
    core.concurrency.reset();
}

fn can_refresh(core: &ExecutorCore, concurrency_type: ConcurrencyType) -> bool {
    if !core.adjuster_enabled(concurrency_type)
        || core.adjuster.load_monitor().is_none()
        || core.is_stop_requested()
    {
        return false;
    }
    match concurrency_type {
        ConcurrencyType::LeadershipCluster | ConcurrencyType::LeadershipBroker => {
            core.phase() == ExecutorPhase::LeaderMovement
        }
        ConcurrencyType::InterBrokerReplica => {
            core.phase() == ExecutorPhase::InterBrokerMovement
                && !core.skip_inter_broker_concurrency_adjustment()
        }
        ConcurrencyType::IntraBrokerReplica => false,
    }
}

async fn min_isr_based_recommendation(
    core: &ExecutorCore,
    monitor: &Arc<dyn LoadMonitor>,
) -> ConcurrencyRecommendation {
    if !core.is_min_isr_check_enabled() {
        return ConcurrencyRecommendation::no_change();
    }
    let cluster = monitor.cluster();
    let cached = core.min_isr_cache.min_isr_by_topic();
    let missing: BTreeSet<String> = cluster
        .topics()
        .into_iter()
        .filter(|t| !cached.contains_key(t))
        .collect();
    if !missing.is_empty() {
        match core.admin.describe_topic_configs(missing).await {
            Ok(configs) => core.min_isr_cache.put_topic_configs(&configs, now_ms()),
            Err(err) => {
                tracing::warn!(error = ?err, "failed to fetch topic configs for min-isr check")
            }
        }
    }
    recommend_from_min_isr(&cluster, &core.min_isr_cache.min_isr_by_topic())
}

async fn refresh_concurrency(
    core: &ExecutorCore,
    can_run_metrics_check: bool,
    concurrency_type: ConcurrencyType,
) {
    if !can_refresh(core, concurrency_type) {
        return;
    }
    let Some(monitor) = core.adjuster.load_monitor() else {
        return;
    };

    let mut reco = min_isr_based_recommendation(core, &monitor).await;
    if reco.stop_execution {
        tracing::info!("stopping the ongoing execution as recommended by the concurrency adjuster");
        core.stop_execution();
        return;
    }
    if reco.is_no_change() && can_run_metrics_check {
        reco = recommend_from_metrics(&monitor.current_broker_metrics(), &core.config.metric_limits);
    }

    for broker in &reco.brokers_to_increase {
        increase_broker_cap(&core.concurrency, *broker, concurrency_type);
    }
    for broker in &reco.brokers_to_decrease {
        decrease_broker_cap(&core.concurrency, *broker, concurrency_type);
    }

    if concurrency_type == ConcurrencyType::LeadershipBroker
        && can_refresh(core, ConcurrencyType::LeadershipCluster)
    {
        if reco.increase_cluster_leadership {
            increase_cluster_leadership_cap(&core.concurrency);
        } else if reco.decrease_cluster_leadership {
            decrease_cluster_leadership_cap(&core.concurrency);
        }
    }
}

/// One adjuster tick.
pub(crate) async fn adjuster_tick(core: &ExecutorCore) {
    if !core.adjuster.is_started() {
        return;
    }
    let checks = core.adjuster.next_check_index();
    let can_run_metrics_check =
        checks % core.config.concurrency_adjuster_num_min_isr_checks.max(1) as u64 == 0;
    refresh_concurrency(core, can_run_metrics_check, ConcurrencyType::InterBrokerReplica).await;
    // One call covers both broker and cluster leadership dimensions.
    refresh_concurrency(core, can_run_metrics_check, ConcurrencyType::LeadershipBroker).await;
}

/// Spawn the periodic adjuster worker.
pub(crate) fn spawn_adjuster(
    core: Arc<ExecutorCore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            adjuster_tick(&core).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{BrokerInfo, PartitionInfo, TopicPartition};
    use crate::concurrency::RequestedConcurrency;
    use crate::config::ExecutorConfig;
    use pretty_assertions::assert_eq;

    fn cluster(brokers: &[BrokerId]) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::default();
        for id in brokers {
            snapshot.brokers.insert(
                *id,
                BrokerInfo {
                    id: *id,
                    host: format!("broker-{id}"),
                    rack: None,
                },
            );
        }
        snapshot
    }

    fn min_isr(topic: &str, min_isr: u32) -> BTreeMap<String, MinIsrWithTime> {
        [(
            topic.to_string(),
            MinIsrWithTime {
                min_isr,
                observed_at_ms: 0,
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn under_min_isr_recommends_stop() {
        let mut snapshot = cluster(&[1, 2, 3]);
        snapshot.partitions.insert(
            TopicPartition::new("t", 0),
            PartitionInfo {
                leader: Some(1),
                replicas: vec![1, 2, 3],
                in_sync_replicas: vec![1],
            },
        );

        let reco = recommend_from_min_isr(&snapshot, &min_isr("t", 2));
        assert!(reco.stop_execution);
        assert!(reco.brokers_to_decrease.is_empty());
    }

    #[test]
    fn at_min_isr_recommends_decrease_for_isr_brokers() {
        let mut snapshot = cluster(&[1, 2, 3]);
        snapshot.partitions.insert(
            TopicPartition::new("t", 4),
            PartitionInfo {
                leader: Some(2),
                replicas: vec![1, 2, 3],
                in_sync_replicas: vec![2, 3],
            },
        );

        let reco = recommend_from_min_isr(&snapshot, &min_isr("t", 2));
        assert!(!reco.stop_execution);
        assert_eq!(reco.brokers_to_decrease, [2, 3].into_iter().collect());
        assert!(reco.brokers_to_increase.is_empty());
    }

    #[test]
    fn isr_check_never_recommends_increase() {
        let mut snapshot = cluster(&[1, 2, 3]);
        snapshot.partitions.insert(
            TopicPartition::new("t", 0),
            PartitionInfo {
                leader: Some(1),
                replicas: vec![1, 2, 3],
                in_sync_replicas: vec![1, 2, 3],
            },
        );

        let reco = recommend_from_min_isr(&snapshot, &min_isr("t", 2));
        assert!(reco.is_no_change());
    }

    #[test]
    fn dead_isr_members_do_not_count_as_live() {
        // Broker 3 is in the ISR list but gone from metadata.
        let mut snapshot = cluster(&[1, 2]);
        snapshot.partitions.insert(
            TopicPartition::new("t", 0),
            PartitionInfo {
                leader: Some(1),
                replicas: vec![1, 2, 3],
                in_sync_replicas: vec![1, 2, 3],
            },
        );

        let reco = recommend_from_min_isr(&snapshot, &min_isr("t", 2));
        assert_eq!(reco.brokers_to_decrease, [1, 2].into_iter().collect());
    }

    #[test]
    fn metric_check_splits_brokers_by_limits() {
        let limits = MetricLimits::default();
        let mut metrics = BTreeMap::new();
        metrics.insert(1, BrokerMetricValues::default());
        metrics.insert(
            2,
            BrokerMetricValues {
                cpu_util_percent: 99.0,
                ..BrokerMetricValues::default()
            },
        );

        let reco = recommend_from_metrics(&metrics, &limits);
        assert_eq!(reco.brokers_to_increase, [1].into_iter().collect());
        assert_eq!(reco.brokers_to_decrease, [2].into_iter().collect());
        assert!(reco.decrease_cluster_leadership);
        assert!(!reco.increase_cluster_leadership);
    }

    #[test]
    fn applying_decreases_halves_caps_down_to_the_minimum() {
        let concurrency = ConcurrencyManager::new(&ExecutorConfig::default());
        concurrency.initialize(
            &[2].into_iter().collect(),
            RequestedConcurrency {
                inter_broker: Some(8),
                ..RequestedConcurrency::default()
            },
        );

        decrease_broker_cap(&concurrency, 2, ConcurrencyType::InterBrokerReplica);
        assert_eq!(concurrency.broker_cap(2, ConcurrencyType::InterBrokerReplica), 4);

        // Decreasing at the minimum is a no-op.
        for _ in 0..10 {
            decrease_broker_cap(&concurrency, 2, ConcurrencyType::InterBrokerReplica);
        }
        assert_eq!(
            concurrency.broker_cap(2, ConcurrencyType::InterBrokerReplica),
            ConcurrencyType::InterBrokerReplica.min_cap()
        );
    }
}
