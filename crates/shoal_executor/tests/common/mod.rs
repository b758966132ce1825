//! Shared mock collaborators for integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use shoal_executor::admin::{
    AdminInterface, ElectionOutcome, LogDirMoveRequest, OngoingReassignment,
    ReassignmentOutcome, ReassignmentRequest, ReplicaLogDirInfo, TopicConfig,
};
use shoal_executor::cluster::{
    BrokerId, BrokerInfo, ClusterSnapshot, MetadataClient, PartitionInfo, TopicPartition,
};
use shoal_executor::config::ExecutorConfig;
use shoal_executor::hooks::{
    AnomalyDetectorManager, ExecutorNotifier, UserTaskInfo, UserTaskManager,
};
use shoal_executor::monitor::{BrokerMetricValues, LoadMonitor, SamplingMode};

/// Honor `RUST_LOG` in test runs; safe to call repeatedly.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Config with intervals small enough for fast tests.
pub fn test_config() -> ExecutorConfig {
    ExecutorConfig {
        execution_progress_check_interval: Duration::from_millis(20),
        min_execution_progress_check_interval: Duration::from_millis(10),
        leader_movement_timeout: Duration::from_secs(5),
        ..ExecutorConfig::default()
    }
}

/// Build a snapshot from broker ids and `(topic, partition, replicas,
/// leader)` tuples; the ISR mirrors the replica set.
pub fn cluster(
    brokers: &[BrokerId],
    partitions: &[(&str, u32, &[BrokerId], Option<BrokerId>)],
) -> ClusterSnapshot {
    let mut snapshot = ClusterSnapshot::default();
    for id in brokers {
        snapshot.brokers.insert(
            *id,
            BrokerInfo {
                id: *id,
                host: format!("broker-{id}.local"),
                rack: None,
            },
        );
    }
    for (topic, partition, replicas, leader) in partitions {
        snapshot.partitions.insert(
            TopicPartition::new(*topic, *partition),
            PartitionInfo {
                leader: *leader,
                replicas: replicas.to_vec(),
                in_sync_replicas: replicas.to_vec(),
            },
        );
    }
    snapshot
}

#[derive(Default)]
pub struct MockAdminState {
    /// Scripted per-partition outcomes; anything else is accepted.
    pub outcome_overrides: BTreeMap<TopicPartition, ReassignmentOutcome>,
    /// Reassignments the mock currently reports as in flight.
    pub ongoing: BTreeMap<TopicPartition, OngoingReassignment>,
    /// Whether accepted submissions get recorded into `ongoing`. Turning
    /// this off simulates a controller dropping submissions.
    pub record_accepted: bool,
    pub submissions: Vec<ReassignmentRequest>,
    pub elections: Vec<TopicPartition>,
    pub log_dir_moves: Vec<LogDirMoveRequest>,
    pub logdirs: BTreeMap<(TopicPartition, BrokerId), ReplicaLogDirInfo>,
    pub topic_configs: BTreeMap<String, TopicConfig>,
    pub throttled_brokers: BTreeSet<BrokerId>,
    pub throttled_topics: BTreeSet<String>,
}

pub struct MockAdmin {
    pub state: Mutex<MockAdminState>,
}

impl MockAdmin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockAdminState {
                record_accepted: true,
                ..MockAdminState::default()
            }),
        }
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    pub fn submissions_for(&self, tp: &TopicPartition) -> Vec<ReassignmentRequest> {
        self.state
            .lock()
            .unwrap()
            .submissions
            .iter()
            .filter(|r| &r.topic_partition == tp)
            .cloned()
            .collect()
    }

    pub fn set_record_accepted(&self, record: bool) {
        self.state.lock().unwrap().record_accepted = record;
    }
}

#[async_trait]
impl AdminInterface for MockAdmin {
    async fn alter_partition_reassignments(
        &self,
        requests: Vec<ReassignmentRequest>,
    ) -> anyhow::Result<BTreeMap<TopicPartition, ReassignmentOutcome>> {
        let mut state = self.state.lock().unwrap();
        let mut outcomes = BTreeMap::new();
        for request in requests {
            let tp = request.topic_partition.clone();
            let outcome = state
                .outcome_overrides
                .get(&tp)
                .copied()
                .unwrap_or(ReassignmentOutcome::Accepted);
            if outcome == ReassignmentOutcome::Accepted {
                match &request.target_replicas {
                    Some(replicas) if state.record_accepted => {
                        state.ongoing.insert(
                            tp.clone(),
                            OngoingReassignment {
                                replicas: replicas.clone(),
                                adding_replicas: Vec::new(),
                                removing_replicas: Vec::new(),
                            },
                        );
                    }
                    Some(_) => {}
                    None => {
                        state.ongoing.remove(&tp);
                    }
                }
            }
            state.submissions.push(request);
            outcomes.insert(tp, outcome);
        }
        Ok(outcomes)
    }

    async fn list_partition_reassignments(
        &self,
    ) -> anyhow::Result<BTreeMap<TopicPartition, OngoingReassignment>> {
        Ok(self.state.lock().unwrap().ongoing.clone())
    }

    async fn elect_preferred_leaders(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> anyhow::Result<BTreeMap<TopicPartition, ElectionOutcome>> {
        let mut state = self.state.lock().unwrap();
        let mut outcomes = BTreeMap::new();
        for tp in partitions {
            state.elections.push(tp.clone());
            outcomes.insert(tp, ElectionOutcome::Elected);
        }
        Ok(outcomes)
    }

    async fn alter_replica_log_dirs(&self, moves: Vec<LogDirMoveRequest>) -> anyhow::Result<()> {
        self.state.lock().unwrap().log_dir_moves.extend(moves);
        Ok(())
    }

    async fn describe_replica_log_dirs(
        &self,
        replicas: Vec<(TopicPartition, BrokerId)>,
    ) -> anyhow::Result<BTreeMap<(TopicPartition, BrokerId), ReplicaLogDirInfo>> {
        let state = self.state.lock().unwrap();
        Ok(replicas
            .into_iter()
            .filter_map(|key| state.logdirs.get(&key).map(|info| (key, info.clone())))
            .collect())
    }

    async fn describe_topic_configs(
        &self,
        topics: BTreeSet<String>,
    ) -> anyhow::Result<BTreeMap<String, TopicConfig>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .topic_configs
            .iter()
            .filter(|(topic, _)| topics.contains(*topic))
            .map(|(topic, config)| (topic.clone(), *config))
            .collect())
    }

    async fn brokers_with_ongoing_log_dir_moves(
        &self,
        _brokers: BTreeSet<BrokerId>,
    ) -> anyhow::Result<BTreeSet<BrokerId>> {
        Ok(BTreeSet::new())
    }

    async fn set_broker_replication_throttle(
        &self,
        broker: BrokerId,
        _bytes_per_sec: u64,
    ) -> anyhow::Result<()> {
        self.state.lock().unwrap().throttled_brokers.insert(broker);
        Ok(())
    }

    async fn clear_broker_replication_throttle(&self, broker: BrokerId) -> anyhow::Result<()> {
        self.state.lock().unwrap().throttled_brokers.remove(&broker);
        Ok(())
    }

    async fn set_topic_throttled_replicas(
        &self,
        topic: &str,
        _replicas: Vec<(u32, BrokerId)>,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .throttled_topics
            .insert(topic.to_string());
        Ok(())
    }

    async fn clear_topic_throttled_replicas(&self, topic: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().throttled_topics.remove(topic);
        Ok(())
    }
}

pub struct MockMetadata {
    current: Mutex<ClusterSnapshot>,
}

impl MockMetadata {
    pub fn new(initial: ClusterSnapshot) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Replace the snapshot returned from now on.
    pub fn set_current(&self, snapshot: ClusterSnapshot) {
        *self.current.lock().unwrap() = snapshot;
    }
}

#[async_trait]
impl MetadataClient for MockMetadata {
    async fn refresh(&self) -> anyhow::Result<ClusterSnapshot> {
        Ok(self.current.lock().unwrap().clone())
    }

    fn cluster(&self) -> ClusterSnapshot {
        self.current.lock().unwrap().clone()
    }
}

pub struct MockLoadMonitor {
    pub cluster: Mutex<ClusterSnapshot>,
    pub metrics: Mutex<BTreeMap<BrokerId, BrokerMetricValues>>,
    pub dead_brokers: Mutex<BTreeSet<BrokerId>>,
    sampling: Mutex<SamplingMode>,
}

impl MockLoadMonitor {
    pub fn new(cluster: ClusterSnapshot) -> Self {
        Self {
            cluster: Mutex::new(cluster),
            metrics: Mutex::new(BTreeMap::new()),
            dead_brokers: Mutex::new(BTreeSet::new()),
            sampling: Mutex::new(SamplingMode::All),
        }
    }
}

#[async_trait]
impl LoadMonitor for MockLoadMonitor {
    async fn brokers_with_replicas(
        &self,
        _timeout: Duration,
    ) -> anyhow::Result<BTreeSet<BrokerId>> {
        Ok(self.cluster.lock().unwrap().broker_ids())
    }

    async fn dead_brokers_with_replicas(
        &self,
        _timeout: Duration,
    ) -> anyhow::Result<BTreeSet<BrokerId>> {
        Ok(self.dead_brokers.lock().unwrap().clone())
    }

    fn cluster(&self) -> ClusterSnapshot {
        self.cluster.lock().unwrap().clone()
    }

    fn current_broker_metrics(&self) -> BTreeMap<BrokerId, BrokerMetricValues> {
        self.metrics.lock().unwrap().clone()
    }

    fn sampling_mode(&self) -> SamplingMode {
        *self.sampling.lock().unwrap()
    }

    fn set_sampling_mode(&self, mode: SamplingMode) {
        *self.sampling.lock().unwrap() = mode;
    }

    fn pause_metric_sampling(&self, _reason: &str, _force: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn resume_metric_sampling(&self, _reason: &str) {}
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<String>>,
    pub alerts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

impl ExecutorNotifier for RecordingNotifier {
    fn send_notification(&self, message: &str) {
        self.notifications.lock().unwrap().push(message.to_string());
    }

    fn send_alert(&self, message: &str) {
        self.alerts.lock().unwrap().push(message.to_string());
    }
}

pub struct NoopAnomalyDetector;

impl AnomalyDetectorManager for NoopAnomalyDetector {
    fn maybe_clear_ongoing_anomaly_detection(&self) {}

    fn reset_has_unfixable_goals(&self) {}

    fn mark_self_healing_finished(&self, _uuid: &str, _complete_with_error: bool) {}
}

#[derive(Default)]
pub struct RecordingUserTasks {
    pub began: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<(String, bool)>>,
}

impl UserTaskManager for RecordingUserTasks {
    fn mark_task_execution_began(&self, uuid: &str) -> anyhow::Result<UserTaskInfo> {
        self.began.lock().unwrap().push(uuid.to_string());
        Ok(UserTaskInfo {
            uuid: uuid.to_string(),
            request_url: format!("/rebalance?uuid={uuid}"),
        })
    }

    fn mark_task_execution_finished(&self, uuid: &str, complete_with_error: bool) {
        self.finished
            .lock()
            .unwrap()
            .push((uuid.to_string(), complete_with_error));
    }
}
