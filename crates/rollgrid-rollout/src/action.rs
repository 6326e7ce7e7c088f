//! Action state machine: which controller report moves an action where.
//!
//! Pure functions only; persistence and side effects live in
//! [`crate::deployment`].

use serde::{Deserialize, Serialize};

use rollgrid_state::{ActionStatus, ActionType};

/// Status as reported by a controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Retrieved,
    Running,
    Download,
    Downloaded,
    Warning,
    Finished,
    Error,
    Canceled,
}

impl std::fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReportedStatus::Retrieved => "retrieved",
            ReportedStatus::Running => "running",
            ReportedStatus::Download => "download",
            ReportedStatus::Downloaded => "downloaded",
            ReportedStatus::Warning => "warning",
            ReportedStatus::Finished => "finished",
            ReportedStatus::Error => "error",
            ReportedStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Status after applying `reported` to an action in `current`, or `None`
/// when the report is not legal there.
pub fn next_status(current: ActionStatus, reported: ReportedStatus) -> Option<ActionStatus> {
    use ActionStatus as S;
    use ReportedStatus as R;

    let next = match (current, reported) {
        (S::Finished | S::Error | S::Canceled, _) => return None,
        // Nothing moves until the assignment is confirmed.
        (S::WaitForConfirmation, _) => return None,

        (S::Canceling, R::Canceled) => S::Canceled,
        (S::Canceling, R::Finished) => S::Finished,
        (S::Canceling, R::Error) => S::Error,
        (S::Canceling, _) => return None,

        (_, R::Canceled) => return None,
        (S::Scheduled, R::Retrieved) => S::Running,
        (current, R::Retrieved) => current,
        (_, R::Running) => S::Running,
        (_, R::Download) => S::Download,
        (_, R::Downloaded) => S::Downloaded,
        (_, R::Warning) => S::Warning,
        (_, R::Finished) => S::Finished,
        (_, R::Error) => S::Error,
    };
    debug_assert!(next.rank() >= current.rank());
    Some(next)
}

/// Whether reaching `status` closes the action.
pub fn closes(status: ActionStatus, action_type: ActionType) -> bool {
    status.is_terminal()
        || (action_type == ActionType::DownloadOnly && status == ActionStatus::Downloaded)
}

/// A report of a terminal outcome on an action that was never retrieved.
pub fn implies_retrieval(current: ActionStatus, next: ActionStatus) -> bool {
    current == ActionStatus::Scheduled && matches!(next, ActionStatus::Finished | ActionStatus::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_REPORTS: [ReportedStatus; 8] = [
        ReportedStatus::Retrieved,
        ReportedStatus::Running,
        ReportedStatus::Download,
        ReportedStatus::Downloaded,
        ReportedStatus::Warning,
        ReportedStatus::Finished,
        ReportedStatus::Error,
        ReportedStatus::Canceled,
    ];

    #[test]
    fn happy_path() {
        let t = ActionType::Forced;
        let running = next_status(ActionStatus::Scheduled, ReportedStatus::Retrieved).unwrap();
        assert_eq!(running, ActionStatus::Running);
        let dl = next_status(running, ReportedStatus::Download).unwrap();
        assert_eq!(dl, ActionStatus::Download);
        let done = next_status(dl, ReportedStatus::Finished).unwrap();
        assert_eq!(done, ActionStatus::Finished);
        assert!(closes(done, t));
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        for terminal in [ActionStatus::Finished, ActionStatus::Error, ActionStatus::Canceled] {
            for report in ALL_REPORTS {
                assert_eq!(next_status(terminal, report), None);
            }
        }
    }

    #[test]
    fn ranks_never_decrease() {
        let statuses = [
            ActionStatus::Scheduled,
            ActionStatus::Running,
            ActionStatus::Download,
            ActionStatus::Downloaded,
            ActionStatus::Warning,
            ActionStatus::Canceling,
        ];
        for current in statuses {
            for report in ALL_REPORTS {
                if let Some(next) = next_status(current, report) {
                    assert!(next.rank() >= current.rank(), "{current} -> {next}");
                }
            }
        }
    }

    #[test]
    fn waiting_for_confirmation_blocks_progress() {
        for report in ALL_REPORTS {
            assert_eq!(
                next_status(ActionStatus::WaitForConfirmation, report),
                None
            );
        }
    }

    #[test]
    fn canceling_only_accepts_outcomes() {
        assert_eq!(
            next_status(ActionStatus::Canceling, ReportedStatus::Canceled),
            Some(ActionStatus::Canceled)
        );
        assert_eq!(
            next_status(ActionStatus::Canceling, ReportedStatus::Finished),
            Some(ActionStatus::Finished)
        );
        assert_eq!(next_status(ActionStatus::Canceling, ReportedStatus::Running), None);
        assert_eq!(next_status(ActionStatus::Running, ReportedStatus::Canceled), None);
    }

    #[test]
    fn finished_without_retrieval_is_accepted() {
        let next = next_status(ActionStatus::Scheduled, ReportedStatus::Finished);
        assert_eq!(next, Some(ActionStatus::Finished));
        assert!(implies_retrieval(ActionStatus::Scheduled, ActionStatus::Finished));
        assert!(!implies_retrieval(ActionStatus::Running, ActionStatus::Finished));
    }

    #[test]
    fn downloaded_closes_download_only() {
        assert!(closes(ActionStatus::Downloaded, ActionType::DownloadOnly));
        assert!(!closes(ActionStatus::Downloaded, ActionType::Forced));
    }
}
