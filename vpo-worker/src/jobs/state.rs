//! Job lifecycle rules.
//!
//! ```text
//! queued ──► running ──► completed
//!   │           ├──────► failed
//!   └───────────┴──────► cancelled
//! ```
//!
//! Terminal states are absorbing. A crashed `running` job is put back to
//! `queued` by orphan recovery, which is not a transition in this table.

use crate::database::models::JobStatus;

impl JobStatus {
    /// Whether a worker or a cancel request may move a job from `self` to `to`.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Statuses a job may be in for a transition into `self` to apply.
    pub fn transition_sources(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[],
            JobStatus::Running => &[JobStatus::Queued],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Running],
            JobStatus::Cancelled => &[JobStatus::Queued, JobStatus::Running],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states_are_absorbing() {
        for from in JobStatus::TERMINAL {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_sources_match_transition_table() {
        for to in ALL {
            for from in ALL {
                assert_eq!(
                    to.transition_sources().contains(&from),
                    from.can_transition_to(to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_running_cannot_go_back_to_queued() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.transition_sources().is_empty());
    }
}
