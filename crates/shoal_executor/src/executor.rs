//! Executor lifecycle: the public surface that accepts proposal batches,
//! starts the execution worker, and exposes stop/shutdown/observer
//! operations.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::admin::{AdminInterface, ReassignmentRequest};
use crate::adjuster::{self, AdjusterState};
use crate::cluster::{BrokerId, MetadataClient, TopicPartition};
use crate::concurrency::{ConcurrencyManager, ConcurrencySummary, ConcurrencyType, RequestedConcurrency};
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution_loop::ProposalExecutionRunner;
use crate::history::{self, BrokerChangeHistory};
use crate::hooks::{AnomalyDetectorManager, ExecutorNotifier, UserTaskManager};
use crate::min_isr_cache::{self, TopicMinIsrCache};
use crate::monitor::LoadMonitor;
use crate::now_ms;
use crate::state::{ExecutorPhase, ExecutorState, MovementProgress, OngoingExecutionInfo};
use crate::strategy::{BaseMovementStrategy, ReplicaMovementStrategy, StrategyOptions};
use crate::task::{ExecutionProposal, ExecutionTask, TaskType};
use crate::tracker::ExecutionTaskTracker;

/// Lazily evaluated reason for an execution; only invoked when a state
/// transition actually happens.
pub type ReasonSupplier = Box<dyn Fn() -> String + Send + Sync>;

/// One-second step applied to the progress check interval per tick.
pub(crate) const PROGRESS_CHECK_INTERVAL_ADJUSTING_MS: u64 = 1000;

/// A batch of proposals to execute, with per-execution overrides.
pub struct ExecutionRequest {
    pub uuid: String,
    pub proposals: Vec<ExecutionProposal>,
    /// Brokers exempt from per-broker concurrency caps.
    pub unthrottled_brokers: BTreeSet<BrokerId>,
    /// Brokers being removed by this execution; recorded in history.
    pub removed_brokers: BTreeSet<BrokerId>,
    pub requested_inter_broker_concurrency: Option<u32>,
    pub requested_max_cluster_inter_broker_movements: Option<u32>,
    pub requested_intra_broker_concurrency: Option<u32>,
    pub requested_cluster_leadership_concurrency: Option<u32>,
    pub requested_broker_leadership_concurrency: Option<u32>,
    pub requested_execution_progress_check_interval: Option<Duration>,
    pub replica_movement_strategy: Option<Arc<dyn ReplicaMovementStrategy>>,
    /// Replication throttle in bytes/sec; `None` disables throttling.
    pub replication_throttle: Option<u64>,
    pub triggered_by_user: bool,
    pub skip_inter_broker_concurrency_adjustment: bool,
}

impl ExecutionRequest {
    pub fn new(uuid: impl Into<String>, proposals: Vec<ExecutionProposal>) -> Self {
        Self {
            uuid: uuid.into(),
            proposals,
            unthrottled_brokers: BTreeSet::new(),
            removed_brokers: BTreeSet::new(),
            requested_inter_broker_concurrency: None,
            requested_max_cluster_inter_broker_movements: None,
            requested_intra_broker_concurrency: None,
            requested_cluster_leadership_concurrency: None,
            requested_broker_leadership_concurrency: None,
            requested_execution_progress_check_interval: None,
            replica_movement_strategy: None,
            replication_throttle: None,
            triggered_by_user: false,
            skip_inter_broker_concurrency_adjustment: false,
        }
    }
}

/// A batch of demotion proposals.
pub struct DemotionRequest {
    pub uuid: String,
    pub proposals: Vec<ExecutionProposal>,
    pub demoted_brokers: BTreeSet<BrokerId>,
    /// Concurrent leadership swaps per demoted broker.
    pub concurrent_swaps: Option<u32>,
    pub requested_cluster_leadership_concurrency: Option<u32>,
    pub requested_broker_leadership_concurrency: Option<u32>,
    pub requested_execution_progress_check_interval: Option<Duration>,
    pub replica_movement_strategy: Option<Arc<dyn ReplicaMovementStrategy>>,
    pub replication_throttle: Option<u64>,
    pub triggered_by_user: bool,
}

impl DemotionRequest {
    pub fn new(
        uuid: impl Into<String>,
        proposals: Vec<ExecutionProposal>,
        demoted_brokers: BTreeSet<BrokerId>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            proposals,
            demoted_brokers,
            concurrent_swaps: None,
            requested_cluster_leadership_concurrency: None,
            requested_broker_leadership_concurrency: None,
            requested_execution_progress_check_interval: None,
            replica_movement_strategy: None,
            replication_throttle: None,
            triggered_by_user: false,
        }
    }
}

/// Shared state hub of the executor; every worker holds an `Arc` to it.
pub(crate) struct ExecutorCore {
    pub(crate) config: ExecutorConfig,
    pub(crate) admin: Arc<dyn AdminInterface>,
    pub(crate) metadata: Arc<dyn MetadataClient>,
    pub(crate) notifier: Arc<dyn ExecutorNotifier>,
    pub(crate) anomaly_detector: Arc<dyn AnomalyDetectorManager>,
    pub(crate) user_task_manager: RwLock<Option<Arc<dyn UserTaskManager>>>,
    pub(crate) tracker: ExecutionTaskTracker,
    pub(crate) concurrency: Arc<ConcurrencyManager>,
    pub(crate) min_isr_cache: Arc<TopicMinIsrCache>,
    pub(crate) history: Arc<BrokerChangeHistory>,
    pub(crate) adjuster: AdjusterState,

    state: RwLock<Arc<ExecutorState>>,
    uuid: RwLock<Option<String>>,
    reason_supplier: RwLock<Option<ReasonSupplier>>,
    triggered_by_user: AtomicBool,
    started_at_ms: AtomicU64,

    stop_signal: AtomicBool,
    has_ongoing_execution: AtomicBool,
    pub(crate) execution_stopped_by_user: AtomicBool,
    ongoing_execution_is_being_modified: AtomicBool,
    num_execution_stopped: AtomicU64,
    num_execution_stopped_by_user: AtomicU64,

    progress_check_interval_ms: AtomicU64,
    requested_progress_check_interval_ms: RwLock<Option<u64>>,
    skip_inter_broker_adjustment: AtomicBool,

    adjuster_inter_broker_enabled: AtomicBool,
    adjuster_leadership_broker_enabled: AtomicBool,
    adjuster_leadership_cluster_enabled: AtomicBool,
    min_isr_check_enabled: AtomicBool,

    /// Short critical section guarding flips of `has_ongoing_execution`.
    pub(crate) flip_ongoing_mutex: AsyncMutex<()>,
    /// Held (one permit) for the whole duration of an ongoing execution;
    /// `shutdown` blocks on it.
    pub(crate) no_ongoing_gate: Semaphore,
}

impl ExecutorCore {
    fn new(
        config: ExecutorConfig,
        admin: Arc<dyn AdminInterface>,
        metadata: Arc<dyn MetadataClient>,
        notifier: Arc<dyn ExecutorNotifier>,
        anomaly_detector: Arc<dyn AnomalyDetectorManager>,
    ) -> Self {
        let concurrency = Arc::new(ConcurrencyManager::new(&config));
        let tracker = ExecutionTaskTracker::new(concurrency.clone());
        let min_isr_cache = Arc::new(TopicMinIsrCache::new(
            config.min_isr_cache_size,
            config.min_isr_cache_retention,
        ));
        let history = Arc::new(BrokerChangeHistory::new(
            config.demotion_history_retention,
            config.removal_history_retention,
        ));
        let initial_interval_ms = config.execution_progress_check_interval.as_millis() as u64;
        Self {
            admin,
            metadata,
            notifier,
            anomaly_detector,
            user_task_manager: RwLock::new(None),
            tracker,
            concurrency,
            min_isr_cache,
            history,
            adjuster: AdjusterState::default(),
            state: RwLock::new(Arc::new(ExecutorState::no_task(
                BTreeSet::new(),
                BTreeSet::new(),
            ))),
            uuid: RwLock::new(None),
            reason_supplier: RwLock::new(None),
            triggered_by_user: AtomicBool::new(false),
            started_at_ms: AtomicU64::new(0),
            stop_signal: AtomicBool::new(false),
            has_ongoing_execution: AtomicBool::new(false),
            execution_stopped_by_user: AtomicBool::new(false),
            ongoing_execution_is_being_modified: AtomicBool::new(false),
            num_execution_stopped: AtomicU64::new(0),
            num_execution_stopped_by_user: AtomicU64::new(0),
            progress_check_interval_ms: AtomicU64::new(initial_interval_ms),
            requested_progress_check_interval_ms: RwLock::new(None),
            skip_inter_broker_adjustment: AtomicBool::new(false),
            adjuster_inter_broker_enabled: AtomicBool::new(
                config.concurrency_adjuster_inter_broker_enabled,
            ),
            adjuster_leadership_broker_enabled: AtomicBool::new(
                config.concurrency_adjuster_leadership_broker_enabled,
            ),
            adjuster_leadership_cluster_enabled: AtomicBool::new(
                config.concurrency_adjuster_leadership_cluster_enabled,
            ),
            min_isr_check_enabled: AtomicBool::new(config.concurrency_adjuster_min_isr_check_enabled),
            flip_ongoing_mutex: AsyncMutex::new(()),
            no_ongoing_gate: Semaphore::new(1),
            config,
        }
    }

    pub(crate) fn state(&self) -> Arc<ExecutorState> {
        self.state.read().unwrap().clone()
    }

    pub(crate) fn phase(&self) -> ExecutorPhase {
        self.state.read().unwrap().phase()
    }

    pub(crate) fn publish_state(&self, state: ExecutorState) {
        *self.state.write().unwrap() = Arc::new(state);
    }

    pub(crate) fn uuid(&self) -> Option<String> {
        self.uuid.read().unwrap().clone()
    }

    pub(crate) fn reason(&self) -> String {
        self.reason_supplier
            .read()
            .unwrap()
            .as_ref()
            .map(|supplier| supplier())
            .unwrap_or_default()
    }

    fn set_execution_context(
        &self,
        uuid: String,
        reason_supplier: ReasonSupplier,
        triggered_by_user: bool,
    ) {
        *self.uuid.write().unwrap() = Some(uuid);
        *self.reason_supplier.write().unwrap() = Some(reason_supplier);
        self.triggered_by_user
            .store(triggered_by_user, Ordering::Release);
        self.started_at_ms.store(now_ms(), Ordering::Release);
    }

    pub(crate) fn clear_execution_context(&self) {
        *self.uuid.write().unwrap() = None;
        *self.reason_supplier.write().unwrap() = None;
    }

    pub(crate) fn ongoing_info(&self) -> OngoingExecutionInfo {
        OngoingExecutionInfo {
            uuid: self.uuid().unwrap_or_default(),
            reason: self.reason(),
            started_at_ms: self.started_at_ms.load(Ordering::Acquire),
            triggered_by_user: self.triggered_by_user.load(Ordering::Acquire),
            recently_demoted: self.history.demoted_brokers(),
            recently_removed: self.history.removed_brokers(),
        }
    }

    pub(crate) fn movement_progress(
        &self,
        types_with_full_list: &BTreeSet<TaskType>,
    ) -> MovementProgress {
        MovementProgress {
            info: self.ongoing_info(),
            tasks: self.tracker.summary(types_with_full_list),
            concurrency: self.concurrency.summary(),
        }
    }

    pub(crate) fn no_task_state(&self) -> ExecutorState {
        ExecutorState::no_task(self.history.demoted_brokers(), self.history.removed_brokers())
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.stop_signal.load(Ordering::Acquire)
    }

    /// Flip the stop signal. Returns `true` when this call flipped it.
    pub(crate) fn stop_execution(&self) -> bool {
        if self
            .stop_signal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.num_execution_stopped.fetch_add(1, Ordering::AcqRel);
            self.tracker.set_stop_requested();
            return true;
        }
        false
    }

    pub(crate) fn reset_stop_signal(&self) {
        self.stop_signal.store(false, Ordering::Release);
    }

    pub(crate) fn has_ongoing_execution(&self) -> bool {
        self.has_ongoing_execution.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_ongoing_execution(&self, value: bool) {
        self.has_ongoing_execution.store(value, Ordering::Release);
    }

    pub(crate) fn adjuster_enabled(&self, concurrency_type: ConcurrencyType) -> bool {
        match concurrency_type {
            ConcurrencyType::InterBrokerReplica => {
                self.adjuster_inter_broker_enabled.load(Ordering::Acquire)
            }
            ConcurrencyType::LeadershipBroker => {
                self.adjuster_leadership_broker_enabled.load(Ordering::Acquire)
            }
            ConcurrencyType::LeadershipCluster => {
                self.adjuster_leadership_cluster_enabled.load(Ordering::Acquire)
            }
            ConcurrencyType::IntraBrokerReplica => false,
        }
    }

    fn set_adjuster_enabled(&self, concurrency_type: ConcurrencyType, enabled: bool) -> bool {
        let flag = match concurrency_type {
            ConcurrencyType::InterBrokerReplica => &self.adjuster_inter_broker_enabled,
            ConcurrencyType::LeadershipBroker => &self.adjuster_leadership_broker_enabled,
            ConcurrencyType::LeadershipCluster => &self.adjuster_leadership_cluster_enabled,
            ConcurrencyType::IntraBrokerReplica => {
                unreachable!("intra-broker adjuster toggles are rejected by the caller")
            }
        };
        flag.swap(enabled, Ordering::AcqRel)
    }

    pub(crate) fn is_min_isr_check_enabled(&self) -> bool {
        self.min_isr_check_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn skip_inter_broker_concurrency_adjustment(&self) -> bool {
        self.skip_inter_broker_adjustment.load(Ordering::Acquire)
    }

    pub(crate) fn progress_check_interval(&self) -> Duration {
        Duration::from_millis(self.progress_check_interval_ms.load(Ordering::Acquire))
    }

    fn requested_or_default_interval_ms(&self) -> u64 {
        self.requested_progress_check_interval_ms
            .read()
            .unwrap()
            .unwrap_or(self.config.execution_progress_check_interval.as_millis() as u64)
    }

    /// Clamp and store the progress check interval.
    pub(crate) fn set_progress_check_interval_ms(&self, interval_ms: u64) {
        let min = self.config.min_execution_progress_check_interval.as_millis() as u64;
        let clamped = interval_ms.min(self.requested_or_default_interval_ms()).max(min);
        let previous = self
            .progress_check_interval_ms
            .swap(clamped, Ordering::AcqRel);
        if previous != clamped {
            tracing::info!(
                previous_ms = previous,
                current_ms = clamped,
                "execution progress check interval changed"
            );
        }
    }

    /// Restore the interval to the requested value, or the default when no
    /// value was requested.
    pub(crate) fn reset_progress_check_interval(&self) {
        let value = self.requested_or_default_interval_ms();
        self.progress_check_interval_ms.store(value, Ordering::Release);
        tracing::info!(interval_ms = value, "execution progress check interval reset");
    }

    fn set_requested_progress_check_interval_ms(&self, interval_ms: Option<u64>) {
        *self.requested_progress_check_interval_ms.write().unwrap() = interval_ms;
        match interval_ms {
            Some(ms) => self.set_progress_check_interval_ms(ms),
            None => self.reset_progress_check_interval(),
        }
    }

    pub(crate) fn reset_modification_intent(&self) {
        self.ongoing_execution_is_being_modified
            .store(false, Ordering::Release);
    }

    /// Reset per-execution state after a failed initialization.
    pub(crate) fn process_execute_proposals_failure(&self) {
        self.tracker.clear();
        self.clear_execution_context();
        self.publish_state(self.no_task_state());
    }
}

/// The executor. One execution runs at a time; public mutators are
/// serialized by a single lock, observers are lock-free.
///
/// Construction spawns the periodic workers (concurrency adjuster, history
/// scanner, MinISR cache cleaner), so it must happen inside a tokio
/// runtime.
pub struct Executor {
    core: Arc<ExecutorCore>,
    op_lock: AsyncMutex<()>,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        admin: Arc<dyn AdminInterface>,
        metadata: Arc<dyn MetadataClient>,
        notifier: Arc<dyn ExecutorNotifier>,
        anomaly_detector: Arc<dyn AnomalyDetectorManager>,
    ) -> Self {
        let core = Arc::new(ExecutorCore::new(
            config,
            admin,
            metadata,
            notifier,
            anomaly_detector,
        ));

        let adjuster_period = core
            .config
            .concurrency_adjuster_interval
            .checked_div(core.config.concurrency_adjuster_num_min_isr_checks.max(1))
            .unwrap_or(core.config.concurrency_adjuster_interval);
        let handles = vec![
            adjuster::spawn_adjuster(core.clone(), adjuster_period),
            history::spawn_scanner(core.history.clone(), core.config.history_scanner_period),
            min_isr_cache::spawn_cleaner(
                core.min_isr_cache.clone(),
                core.config.min_isr_cache_cleaner_period,
            ),
        ];

        Self {
            core,
            op_lock: AsyncMutex::new(()),
            worker_handles: Mutex::new(handles),
        }
    }

    /// Let the executor retrieve information about the requests that
    /// trigger executions. Must be set before a user-triggered execution.
    pub fn set_user_task_manager(&self, user_task_manager: Arc<dyn UserTaskManager>) {
        *self.core.user_task_manager.write().unwrap() = Some(user_task_manager);
    }

    /// Announce that proposals are being generated for an execution.
    pub async fn set_generating_proposals_for_execution(
        &self,
        uuid: impl Into<String>,
        reason_supplier: ReasonSupplier,
        triggered_by_user: bool,
    ) -> ExecutorResult<()> {
        let _guard = self.op_lock.lock().await;
        let uuid = uuid.into();
        if uuid.is_empty() {
            return Err(ExecutorError::InvalidArgument(
                "uuid of the execution cannot be empty".into(),
            ));
        }
        let phase = self.core.phase();
        if phase != ExecutorPhase::NoTask {
            return Err(ExecutorError::OngoingExecution(format!(
                "cannot generate proposals while the executor is in {phase:?} state"
            )));
        }
        self.core
            .set_execution_context(uuid, reason_supplier, triggered_by_user);
        self.core
            .publish_state(ExecutorState::GeneratingProposals(self.core.ongoing_info()));
        Ok(())
    }

    /// Report that proposal generation failed. A no-op unless the executor
    /// is generating proposals for the same uuid.
    pub async fn fail_generating_proposals_for_execution(&self, uuid: &str) {
        let _guard = self.op_lock.lock().await;
        if self.core.phase() != ExecutorPhase::GeneratingProposals {
            return;
        }
        match self.core.uuid() {
            Some(current) if current == uuid => {
                tracing::warn!(
                    uuid,
                    reason = %self.core.reason(),
                    "failed to generate proposals for execution"
                );
                self.core.clear_execution_context();
                self.core.publish_state(self.core.no_task_state());
            }
            current => {
                tracing::warn!(
                    received = uuid,
                    expected = ?current,
                    "uuid mismatch in attempt to report failed proposal generation"
                );
            }
        }
    }

    /// Initialize and start executing a proposal batch.
    pub async fn execute_proposals(
        &self,
        load_monitor: Arc<dyn LoadMonitor>,
        request: ExecutionRequest,
    ) -> ExecutorResult<()> {
        let _guard = self.op_lock.lock().await;
        self.core.skip_inter_broker_adjustment.store(
            request.skip_inter_broker_concurrency_adjustment,
            Ordering::Release,
        );
        self.sanity_check_execute(&request.uuid)?;

        let requested = RequestedConcurrency {
            inter_broker: request.requested_inter_broker_concurrency,
            intra_broker: request.requested_intra_broker_concurrency,
            broker_leadership: request.requested_broker_leadership_concurrency,
            cluster_leadership: request.requested_cluster_leadership_concurrency,
        };
        let result = self
            .init_and_start(
                load_monitor,
                request.proposals,
                request.unthrottled_brokers,
                requested,
                request.requested_max_cluster_inter_broker_movements,
                request.requested_execution_progress_check_interval,
                request.replica_movement_strategy,
                request.replication_throttle,
                request.triggered_by_user,
                None,
                Some(request.removed_brokers),
            )
            .await;
        if let Err(err) = &result {
            match err {
                ExecutorError::OngoingExecution(_) => tracing::info!(
                    uuid = %request.uuid,
                    "execution aborted due to an ongoing execution"
                ),
                _ => tracing::error!(uuid = %request.uuid, error = %err, "execution failed to start"),
            }
            self.core.process_execute_proposals_failure();
        }
        result
    }

    /// Initialize and start executing demotion proposals.
    pub async fn execute_demote_proposals(
        &self,
        load_monitor: Arc<dyn LoadMonitor>,
        request: DemotionRequest,
    ) -> ExecutorResult<()> {
        let _guard = self.op_lock.lock().await;
        // Demotions only move leadership; never auto-adjust inter-broker caps.
        self.core
            .skip_inter_broker_adjustment
            .store(true, Ordering::Release);
        self.sanity_check_execute(&request.uuid)?;

        let requested = RequestedConcurrency {
            inter_broker: request.concurrent_swaps,
            intra_broker: None,
            broker_leadership: request.requested_broker_leadership_concurrency,
            cluster_leadership: request.requested_cluster_leadership_concurrency,
        };
        let result = self
            .init_and_start(
                load_monitor,
                request.proposals,
                request.demoted_brokers.clone(),
                requested,
                None,
                request.requested_execution_progress_check_interval,
                request.replica_movement_strategy,
                request.replication_throttle,
                request.triggered_by_user,
                Some(request.demoted_brokers),
                None,
            )
            .await;
        if let Err(err) = &result {
            tracing::error!(uuid = %request.uuid, error = %err, "demotion failed to start");
            self.core.process_execute_proposals_failure();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn init_and_start(
        &self,
        load_monitor: Arc<dyn LoadMonitor>,
        proposals: Vec<ExecutionProposal>,
        brokers_to_skip_concurrency_check: BTreeSet<BrokerId>,
        requested: RequestedConcurrency,
        requested_max_cluster_inter_broker_movements: Option<u32>,
        requested_progress_check_interval: Option<Duration>,
        strategy: Option<Arc<dyn ReplicaMovementStrategy>>,
        replication_throttle: Option<u64>,
        triggered_by_user: bool,
        demoted_brokers: Option<BTreeSet<BrokerId>>,
        removed_brokers: Option<BTreeSet<BrokerId>>,
    ) -> ExecutorResult<()> {
        // Initialization: prime the tracker, the concurrency manager, and
        // the adjuster.
        self.core
            .publish_state(ExecutorState::Starting(self.core.ongoing_info()));
        let cluster = self.core.metadata.refresh().await.map_err(|err| {
            ExecutorError::IllegalState(format!("failed to refresh cluster metadata: {err:#}"))
        })?;
        let opts = StrategyOptions {
            cluster,
            min_isr_by_topic: self.core.min_isr_cache.min_isr_by_topic(),
        };
        let strategy = strategy.unwrap_or_else(|| Arc::new(BaseMovementStrategy));
        self.core.tracker.add_proposals(
            &proposals,
            brokers_to_skip_concurrency_check,
            &opts,
            strategy.as_ref(),
        );
        adjuster::init_adjustment(&self.core, load_monitor.clone(), requested)
            .await
            .map_err(|err| {
                ExecutorError::IllegalState(format!(
                    "failed to initialize concurrency adjustment: {err:#}"
                ))
            })?;
        self.core
            .concurrency
            .set_cluster_inter_broker_cap(requested_max_cluster_inter_broker_movements);
        if let Some(interval) = requested_progress_check_interval {
            if interval < self.core.config.min_execution_progress_check_interval {
                return Err(ExecutorError::InvalidArgument(format!(
                    "requested progress check interval {interval:?} is below the minimum {:?}",
                    self.core.config.min_execution_progress_check_interval
                )));
            }
        }
        self.core.set_requested_progress_check_interval_ms(
            requested_progress_check_interval.map(|d| d.as_millis() as u64),
        );

        // Start: flip the ongoing flag under the gate and dispatch the
        // execution worker.
        self.core
            .execution_stopped_by_user
            .store(false, Ordering::Release);
        self.sanity_check_ongoing_movement().await?;

        {
            let _flip = self.core.flip_ongoing_mutex.lock().await;
            self.core.set_has_ongoing_execution(true);
            self.core.reset_stop_signal();
            match self.core.no_ongoing_gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    self.core.set_has_ongoing_execution(false);
                    return Err(ExecutorError::Interrupted(
                        "executor is shutting down".into(),
                    ));
                }
            }
        }

        self.core.anomaly_detector.maybe_clear_ongoing_anomaly_detection();
        self.core.anomaly_detector.reset_has_unfixable_goals();
        self.core
            .execution_stopped_by_user
            .store(false, Ordering::Release);

        if triggered_by_user && self.core.user_task_manager.read().unwrap().is_none() {
            self.core.set_has_ongoing_execution(false);
            self.core.no_ongoing_gate.add_permits(1);
            self.core.reset_stop_signal();
            return Err(ExecutorError::IllegalState(
                "user task manager must be set before a user-triggered execution".into(),
            ));
        }

        let now = now_ms();
        if let Some(demoted) = &demoted_brokers {
            self.core.history.record_demoted(demoted.iter().copied(), now);
        }
        if let Some(removed) = &removed_brokers {
            self.core.history.record_removed(removed.iter().copied(), now);
        }

        let runner = ProposalExecutionRunner::new(
            self.core.clone(),
            load_monitor,
            replication_throttle,
            triggered_by_user,
        );
        tokio::spawn(runner.run());
        Ok(())
    }

    fn sanity_check_execute(&self, uuid: &str) -> ExecutorResult<()> {
        if self.core.has_ongoing_execution() {
            return Err(ExecutorError::OngoingExecution(
                "cannot execute new proposals while there is an ongoing execution".into(),
            ));
        }
        let phase = self.core.phase();
        if phase != ExecutorPhase::GeneratingProposals {
            return Err(ExecutorError::IllegalState(format!(
                "unexpected executor state {phase:?}; initializing proposal execution requires \
                 generating proposals for execution"
            )));
        }
        match self.core.uuid() {
            Some(current) if current == uuid => Ok(()),
            current => Err(ExecutorError::IllegalState(format!(
                "attempt to initialize proposal execution with uuid {uuid} while proposals were \
                 generated for {current:?}"
            ))),
        }
    }

    /// Ensure no external agent has movements in flight.
    async fn sanity_check_ongoing_movement(&self) -> ExecutorResult<()> {
        let ongoing = self
            .core
            .admin
            .list_partition_reassignments()
            .await
            .map_err(|err| {
                ExecutorError::IllegalState(format!(
                    "failed to retrieve ongoing partition reassignments: {err:#}"
                ))
            })?;
        if !ongoing.is_empty() {
            let partitions: Vec<String> = ongoing.keys().map(|tp| tp.to_string()).collect();
            return Err(ExecutorError::OngoingExecution(format!(
                "there are ongoing inter-broker partition movements: {partitions:?}"
            )));
        }

        let brokers = self.core.metadata.cluster().broker_ids();
        let moving = self
            .core
            .admin
            .brokers_with_ongoing_log_dir_moves(brokers)
            .await
            .map_err(|err| {
                ExecutorError::IllegalState(format!(
                    "failed to retrieve ongoing intra-broker movements: {err:#}"
                ))
            })?;
        if !moving.is_empty() {
            return Err(ExecutorError::OngoingExecution(format!(
                "there are ongoing intra-broker partition movements on brokers {moving:?}"
            )));
        }
        Ok(())
    }

    /// Request the executor to stop the ongoing execution. Returns `true`
    /// when this call flipped the stop signal.
    pub async fn user_triggered_stop_execution(&self, stop_external_agent: bool) -> bool {
        let _guard = self.op_lock.lock().await;
        let flipped = self.core.stop_execution();
        if flipped {
            tracing::info!(uuid = ?self.core.uuid(), "user requested to stop the ongoing execution");
            self.core
                .num_execution_stopped_by_user
                .fetch_add(1, Ordering::AcqRel);
            self.core
                .execution_stopped_by_user
                .store(true, Ordering::Release);
        }
        if stop_external_agent && self.maybe_stop_external_agent().await {
            tracing::info!("request to stop the external agent's partition reassignment submitted");
        }
        flipped
    }

    /// Cancel reassignments started by an external agent. Skipped while a
    /// local execution is in progress.
    pub async fn maybe_stop_external_agent(&self) -> bool {
        if self.core.has_ongoing_execution() {
            tracing::debug!(
                "skipping external agent reassignment cancellation during a local execution"
            );
            return false;
        }
        let ongoing = match self.core.admin.list_partition_reassignments().await {
            Ok(ongoing) => ongoing,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to list partition reassignments");
                return false;
            }
        };
        if ongoing.is_empty() {
            return false;
        }
        let requests: Vec<ReassignmentRequest> = ongoing
            .keys()
            .map(|tp| ReassignmentRequest {
                topic_partition: tp.clone(),
                target_replicas: None,
            })
            .collect();
        match self.core.admin.alter_partition_reassignments(requests).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to cancel external agent reassignments");
                false
            }
        }
    }

    /// Stop any ongoing execution, wait for it to drain, and cancel the
    /// periodic workers.
    pub async fn shutdown(&self) {
        let _guard = self.op_lock.lock().await;
        tracing::info!("shutting down executor");
        {
            let _flip = self.core.flip_ongoing_mutex.lock().await;
            if self.core.has_ongoing_execution() {
                tracing::warn!("shutdown may take a while because an execution is in progress");
                self.core.stop_execution();
            }
            tracing::info!("waiting for any ongoing execution to stop");
            if let Ok(permit) = self.core.no_ongoing_gate.acquire().await {
                // Keep the permit so no new execution can start.
                permit.forget();
            }
        }
        for handle in self.worker_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        tracing::info!("executor shutdown completed");
    }

    /// Set the interval between execution progress checks; `None` restores
    /// the default.
    pub async fn set_requested_execution_progress_check_interval(
        &self,
        interval: Option<Duration>,
    ) -> ExecutorResult<()> {
        let _guard = self.op_lock.lock().await;
        if let Some(interval) = interval {
            if interval < self.core.config.min_execution_progress_check_interval {
                return Err(ExecutorError::InvalidArgument(format!(
                    "progress check interval {interval:?} is below the minimum {:?}",
                    self.core.config.min_execution_progress_check_interval
                )));
            }
        }
        self.core
            .set_requested_progress_check_interval_ms(interval.map(|d| d.as_millis() as u64));
        Ok(())
    }

    pub fn execution_progress_check_interval(&self) -> Duration {
        self.core.progress_check_interval()
    }

    /// Enable or disable the concurrency adjuster for one dimension.
    /// Returns the previous setting.
    pub async fn set_concurrency_adjuster_for(
        &self,
        concurrency_type: ConcurrencyType,
        enabled: bool,
    ) -> ExecutorResult<bool> {
        let _guard = self.op_lock.lock().await;
        if concurrency_type == ConcurrencyType::IntraBrokerReplica {
            return Err(ExecutorError::InvalidArgument(
                "concurrency adjuster for intra-broker movements is not supported".into(),
            ));
        }
        Ok(self.core.set_adjuster_enabled(concurrency_type, enabled))
    }

    /// Toggle (At/Under)MinISR-based adjustment. Returns the previous
    /// setting.
    pub async fn set_concurrency_adjuster_min_isr_check(&self, enabled: bool) -> bool {
        let _guard = self.op_lock.lock().await;
        self.core.min_isr_check_enabled.swap(enabled, Ordering::AcqRel)
    }

    /// Set the per-broker cap of a dimension for every broker, or the
    /// cluster cap; `None` restores the default.
    pub async fn set_execution_concurrency_for_all_brokers_or_cluster(
        &self,
        concurrency: Option<u32>,
        concurrency_type: ConcurrencyType,
    ) {
        let _guard = self.op_lock.lock().await;
        self.core
            .concurrency
            .set_for_all_brokers_or_cluster(concurrency, concurrency_type);
    }

    /// Set the cap of one broker in a per-broker dimension.
    pub async fn set_execution_concurrency_for_broker(
        &self,
        broker: BrokerId,
        concurrency: u32,
        concurrency_type: ConcurrencyType,
    ) -> ExecutorResult<()> {
        let _guard = self.op_lock.lock().await;
        if concurrency_type == ConcurrencyType::LeadershipCluster {
            return Err(ExecutorError::InvalidArgument(
                "cluster leadership concurrency has no per-broker cap".into(),
            ));
        }
        self.core
            .concurrency
            .set_for_broker(broker, concurrency, concurrency_type);
        Ok(())
    }

    pub fn add_recently_demoted_brokers(&self, brokers: BTreeSet<BrokerId>) {
        self.core.history.add_permanent_demoted(brokers);
    }

    pub fn add_recently_removed_brokers(&self, brokers: BTreeSet<BrokerId>) {
        self.core.history.add_permanent_removed(brokers);
    }

    pub fn drop_recently_demoted_brokers(&self, brokers: &BTreeSet<BrokerId>) -> bool {
        self.core.history.drop_demoted(brokers)
    }

    pub fn drop_recently_removed_brokers(&self, brokers: &BTreeSet<BrokerId>) -> bool {
        self.core.history.drop_removed(brokers)
    }

    pub fn recently_demoted_brokers(&self) -> BTreeSet<BrokerId> {
        self.core.history.demoted_brokers()
    }

    pub fn recently_removed_brokers(&self) -> BTreeSet<BrokerId> {
        self.core.history.removed_brokers()
    }

    /// Declare (or cancel) the intent to modify the ongoing execution.
    /// Only one caller at a time can hold the intent.
    pub fn modify_ongoing_execution(&self, modify: bool) -> bool {
        self.core
            .ongoing_execution_is_being_modified
            .compare_exchange(!modify, modify, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_ongoing_execution(&self) -> bool {
        self.core.has_ongoing_execution()
    }

    pub fn state(&self) -> Arc<ExecutorState> {
        self.core.state()
    }

    /// Tasks currently `InProgress` or `Aborting` across all types.
    pub fn in_execution_tasks(&self) -> Vec<ExecutionTask> {
        self.core.tracker.in_execution_tasks(None)
    }

    pub fn is_concurrency_manager_initialized(&self) -> bool {
        self.core.concurrency.is_initialized()
    }

    pub fn is_concurrency_adjuster_started(&self) -> bool {
        self.core.adjuster.is_started()
    }

    pub fn execution_concurrency_summary(&self) -> ConcurrencySummary {
        self.core.concurrency.summary()
    }

    pub fn num_execution_stopped(&self) -> u64 {
        self.core.num_execution_stopped.load(Ordering::Acquire)
    }

    pub fn num_execution_stopped_by_user(&self) -> u64 {
        self.core.num_execution_stopped_by_user.load(Ordering::Acquire)
    }

    /// Partitions currently being reassigned on the cluster. An empty
    /// response does not prove there is no ongoing execution; batches are
    /// submitted periodically, with gaps in between.
    pub async fn list_partitions_being_reassigned(&self) -> anyhow::Result<Vec<TopicPartition>> {
        Ok(self
            .core
            .admin
            .list_partition_reassignments()
            .await?
            .into_keys()
            .collect())
    }

    pub async fn has_ongoing_partition_reassignments(&self) -> anyhow::Result<bool> {
        Ok(!self
            .core
            .admin
            .list_partition_reassignments()
            .await?
            .is_empty())
    }
}
