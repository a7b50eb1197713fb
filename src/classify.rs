//! Outcome classification.

use crate::error::TaskError;
use crate::types::{OutcomeStatus, RaceBranch};

/// Maps the race winner and any observed error to an [`OutcomeStatus`].
///
/// Total over its inputs; every combination has exactly one status.
///
/// | branch | error | status |
/// |--------|-------|--------|
/// | `Completed` | none | `FINISHED` |
/// | `Completed` | some | `FINISHED_WITH_ERROR` |
/// | `Cancelled` | none | `CANCELLED` |
/// | `Cancelled` | some | `CANCELLED_WITH_ERROR` |
///
/// # Examples
///
/// ```
/// use cancelable_worker::{classify, OutcomeStatus, RaceBranch, TaskError};
///
/// assert_eq!(classify(RaceBranch::Completed, None), OutcomeStatus::Finished);
///
/// let kill_failed = TaskError::Termination { message: "gone".into() };
/// assert_eq!(
///     classify(RaceBranch::Cancelled, Some(&kill_failed)),
///     OutcomeStatus::CancelledWithError,
/// );
/// ```
pub fn classify(branch: RaceBranch, error: Option<&TaskError>) -> OutcomeStatus {
    match (branch, error.is_some()) {
        (RaceBranch::Completed, false) => OutcomeStatus::Finished,
        (RaceBranch::Completed, true) => OutcomeStatus::FinishedWithError,
        (RaceBranch::Cancelled, false) => OutcomeStatus::Cancelled,
        (RaceBranch::Cancelled, true) => OutcomeStatus::CancelledWithError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_branch() {
        let err = TaskError::Runtime {
            message: "wait failed".to_string(),
        };
        assert_eq!(classify(RaceBranch::Completed, None), OutcomeStatus::Finished);
        assert_eq!(
            classify(RaceBranch::Completed, Some(&err)),
            OutcomeStatus::FinishedWithError
        );
    }

    #[test]
    fn cancelled_branch() {
        let err = TaskError::Termination {
            message: "kill failed".to_string(),
        };
        assert_eq!(classify(RaceBranch::Cancelled, None), OutcomeStatus::Cancelled);
        assert_eq!(
            classify(RaceBranch::Cancelled, Some(&err)),
            OutcomeStatus::CancelledWithError
        );
    }
}
