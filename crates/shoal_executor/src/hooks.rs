//! Completion hooks toward the surrounding system: user-task bookkeeping,
//! anomaly-detector notifications, and operator-facing alerts.

use serde::{Deserialize, Serialize};

/// Details of the user request that triggered an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTaskInfo {
    pub uuid: String,
    pub request_url: String,
}

/// Bookkeeping for user-triggered executions.
pub trait UserTaskManager: Send + Sync {
    fn mark_task_execution_began(&self, uuid: &str) -> anyhow::Result<UserTaskInfo>;

    fn mark_task_execution_finished(&self, uuid: &str, complete_with_error: bool);
}

/// Bookkeeping for self-healing executions.
pub trait AnomalyDetectorManager: Send + Sync {
    fn maybe_clear_ongoing_anomaly_detection(&self);

    fn reset_has_unfixable_goals(&self);

    fn mark_self_healing_finished(&self, uuid: &str, complete_with_error: bool);
}

/// Outbound operator notifications.
pub trait ExecutorNotifier: Send + Sync {
    /// Informational message about a completed execution.
    fn send_notification(&self, message: &str);

    /// Something went wrong or needs operator attention.
    fn send_alert(&self, message: &str);
}
