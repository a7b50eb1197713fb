//! Race branches, outcome statuses and the terminal [`TaskOutcome`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Which side of the completion/cancellation race won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceBranch {
    /// The workload exited on its own (or failed while being awaited).
    Completed,
    /// The cancellation watch fired first.
    Cancelled,
}

/// How a task ended. These four values are the only statuses that exist.
///
/// # Examples
///
/// ```
/// use cancelable_worker::OutcomeStatus;
///
/// assert_eq!(OutcomeStatus::CancelledWithError.to_string(), "CANCELLED_WITH_ERROR");
/// assert!(OutcomeStatus::Cancelled.is_cancelled());
/// assert!(!OutcomeStatus::Finished.has_error());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    /// Natural completion, no error.
    Finished,
    /// Natural completion path with an error (including start failures).
    FinishedWithError,
    /// Cancellation won the race and teardown succeeded.
    Cancelled,
    /// Cancellation won the race but an error was observed.
    CancelledWithError,
}

impl OutcomeStatus {
    /// All statuses, in declaration order.
    pub const ALL: [OutcomeStatus; 4] = [
        Self::Finished,
        Self::FinishedWithError,
        Self::Cancelled,
        Self::CancelledWithError,
    ];

    /// Returns `true` for the two `*_WITH_ERROR` variants.
    pub fn has_error(&self) -> bool {
        matches!(self, Self::FinishedWithError | Self::CancelledWithError)
    }

    /// Returns `true` when the cancellation branch won.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::CancelledWithError)
    }

    /// The race branch this status belongs to.
    pub fn branch(&self) -> RaceBranch {
        if self.is_cancelled() {
            RaceBranch::Cancelled
        } else {
            RaceBranch::Completed
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => write!(f, "FINISHED"),
            Self::FinishedWithError => write!(f, "FINISHED_WITH_ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::CancelledWithError => write!(f, "CANCELLED_WITH_ERROR"),
        }
    }
}

/// Terminal result of one task, reported to the queue.
///
/// Immutable once built. `exit_code` is the workload's exit status when the
/// completion branch observed one; `error` is set for `*_WITH_ERROR`
/// statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    task_id: String,
    status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
    finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// Builds an outcome stamped with the current time.
    pub fn new(
        task_id: impl Into<String>,
        status: OutcomeStatus,
        exit_code: Option<i64>,
        error: Option<TaskError>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            exit_code,
            error,
            finished_at: Utc::now(),
        }
    }

    /// The task this outcome belongs to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The classified status.
    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    /// Workload exit code, if the workload was observed exiting.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }

    /// The error attached to a `*_WITH_ERROR` outcome.
    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// When the outcome was determined.
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        for (status, name) in OutcomeStatus::ALL.iter().zip([
            "FINISHED",
            "FINISHED_WITH_ERROR",
            "CANCELLED",
            "CANCELLED_WITH_ERROR",
        ]) {
            assert_eq!(serde_json::to_value(status).unwrap(), name);
            assert_eq!(status.to_string(), name);
        }
    }

    #[test]
    fn status_branch_matches_predicates() {
        for status in OutcomeStatus::ALL {
            assert_eq!(
                status.branch() == RaceBranch::Cancelled,
                status.is_cancelled()
            );
        }
    }

    #[test]
    fn outcome_omits_absent_fields() {
        let outcome = TaskOutcome::new("t1", OutcomeStatus::Finished, None, None);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["status"], "FINISHED");
        assert!(json.get("error").is_none());
        assert!(json.get("exitCode").is_none());
        assert!(json.get("finishedAt").is_some());
    }
}
