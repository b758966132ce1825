//! Executor lifecycle state, published as an immutable value.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::cluster::BrokerId;
use crate::concurrency::ConcurrencySummary;
use crate::tracker::ExecutionTasksSummary;

/// Phase tag of the executor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutorPhase {
    NoTask,
    GeneratingProposals,
    Starting,
    InterBrokerMovement,
    IntraBrokerMovement,
    LeaderMovement,
    Stopping,
}

/// Payload common to every non-idle state.
#[derive(Debug, Clone, Serialize)]
pub struct OngoingExecutionInfo {
    pub uuid: String,
    pub reason: String,
    pub started_at_ms: u64,
    pub triggered_by_user: bool,
    pub recently_demoted: BTreeSet<BrokerId>,
    pub recently_removed: BTreeSet<BrokerId>,
}

/// Progress payload of the in-movement and stopping states.
#[derive(Debug, Clone, Serialize)]
pub struct MovementProgress {
    pub info: OngoingExecutionInfo,
    pub tasks: ExecutionTasksSummary,
    pub concurrency: ConcurrencySummary,
}

/// The executor's published state. Each published value is immutable;
/// transitions replace the whole value.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutorState {
    NoTask {
        recently_demoted: BTreeSet<BrokerId>,
        recently_removed: BTreeSet<BrokerId>,
    },
    GeneratingProposals(OngoingExecutionInfo),
    Starting(OngoingExecutionInfo),
    InterBrokerMovement(MovementProgress),
    IntraBrokerMovement(MovementProgress),
    LeaderMovement(MovementProgress),
    Stopping(MovementProgress),
}

impl ExecutorState {
    pub fn no_task(
        recently_demoted: BTreeSet<BrokerId>,
        recently_removed: BTreeSet<BrokerId>,
    ) -> Self {
        ExecutorState::NoTask {
            recently_demoted,
            recently_removed,
        }
    }

    pub fn phase(&self) -> ExecutorPhase {
        match self {
            ExecutorState::NoTask { .. } => ExecutorPhase::NoTask,
            ExecutorState::GeneratingProposals(_) => ExecutorPhase::GeneratingProposals,
            ExecutorState::Starting(_) => ExecutorPhase::Starting,
            ExecutorState::InterBrokerMovement(_) => ExecutorPhase::InterBrokerMovement,
            ExecutorState::IntraBrokerMovement(_) => ExecutorPhase::IntraBrokerMovement,
            ExecutorState::LeaderMovement(_) => ExecutorPhase::LeaderMovement,
            ExecutorState::Stopping(_) => ExecutorPhase::Stopping,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        match self {
            ExecutorState::NoTask { .. } => None,
            ExecutorState::GeneratingProposals(info) | ExecutorState::Starting(info) => {
                Some(&info.uuid)
            }
            ExecutorState::InterBrokerMovement(progress)
            | ExecutorState::IntraBrokerMovement(progress)
            | ExecutorState::LeaderMovement(progress)
            | ExecutorState::Stopping(progress) => Some(&progress.info.uuid),
        }
    }

    /// JSON rendering served to operator-facing surfaces.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_and_uuid_accessors() {
        let idle = ExecutorState::no_task(BTreeSet::new(), BTreeSet::new());
        assert_eq!(idle.phase(), ExecutorPhase::NoTask);
        assert_eq!(idle.uuid(), None);

        let info = OngoingExecutionInfo {
            uuid: "u-1".into(),
            reason: "rebalance".into(),
            started_at_ms: 1,
            triggered_by_user: true,
            recently_demoted: BTreeSet::new(),
            recently_removed: BTreeSet::new(),
        };
        let generating = ExecutorState::GeneratingProposals(info);
        assert_eq!(generating.phase(), ExecutorPhase::GeneratingProposals);
        assert_eq!(generating.uuid(), Some("u-1"));
    }

    #[test]
    fn json_rendering_carries_the_uuid() {
        let info = OngoingExecutionInfo {
            uuid: "u-2".into(),
            reason: "broker removal".into(),
            started_at_ms: 42,
            triggered_by_user: false,
            recently_demoted: BTreeSet::new(),
            recently_removed: [3].into_iter().collect(),
        };
        let json = ExecutorState::Starting(info).to_json().unwrap();
        assert!(json.contains("u-2"));
        assert!(json.contains("Starting"));
    }
}
