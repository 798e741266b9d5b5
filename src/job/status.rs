//! Job status state machine
//!
//! A job's status is never stored on its own: it is the status of the last entry in
//! the job's append-only log. Every change goes through [`check_transition`].

use crate::error::{DispatchError, DispatchResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Started,
    Pending,
    Resending,
    Recovering,
    Warning,
    Stored,
    Mined,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Pending => "PENDING",
            Self::Resending => "RESENDING",
            Self::Recovering => "RECOVERING",
            Self::Warning => "WARNING",
            Self::Stored => "STORED",
            Self::Mined => "MINED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Mined | Self::Failed)
    }

    /// Statuses reachable from `self`
    pub fn next_allowed(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Created => &[Started],
            Started => &[Pending, Stored, Resending, Recovering, Warning, Failed],
            Pending => &[Pending, Resending, Recovering, Warning, Mined, Failed],
            Resending => &[Pending, Resending, Recovering, Warning, Mined, Failed],
            Recovering => &[Pending, Stored, Resending, Recovering, Warning, Failed],
            Warning => &[Pending, Stored, Resending, Recovering, Warning, Mined, Failed],
            Stored => &[Failed],
            Mined | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.next_allowed().contains(&next)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "STARTED" => Ok(Self::Started),
            "PENDING" => Ok(Self::Pending),
            "RESENDING" => Ok(Self::Resending),
            "RECOVERING" => Ok(Self::Recovering),
            "WARNING" => Ok(Self::Warning),
            "STORED" => Ok(Self::Stored),
            "MINED" => Ok(Self::Mined),
            "FAILED" => Ok(Self::Failed),
            other => Err(DispatchError::InvalidFormat(format!(
                "unknown job status {other}"
            ))),
        }
    }
}

/// One entry of a job's status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLog {
    pub status: JobStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StatusLog {
    pub fn new(status: JobStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            created_at: Utc::now(),
        }
    }
}

/// Validate a status change for a job currently in `current`
pub fn check_transition(current: JobStatus, next: JobStatus) -> DispatchResult<()> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(DispatchError::InvalidState(format!(
            "cannot move job from {current} to {next}"
        )))
    }
}

/// Guard for starting a job
pub fn check_startable(current: JobStatus) -> DispatchResult<()> {
    if current == JobStatus::Created {
        Ok(())
    } else {
        Err(DispatchError::InvalidState(format!(
            "job cannot be started from status {current}"
        )))
    }
}

/// Guard for attaching a child job to `parent_status`
pub fn check_child_allowed(parent_status: JobStatus) -> DispatchResult<()> {
    if parent_status == JobStatus::Pending {
        Ok(())
    } else {
        Err(DispatchError::InvalidState(format!(
            "cannot create a child job in a finalized schedule (parent is {parent_status})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_exit() {
        for status in [JobStatus::Mined, JobStatus::Failed] {
            assert!(status.is_terminal());
            assert!(status.next_allowed().is_empty());
        }
    }

    #[test]
    fn created_only_moves_to_started() {
        assert!(check_transition(JobStatus::Created, JobStatus::Started).is_ok());
        assert!(matches!(
            check_transition(JobStatus::Created, JobStatus::Pending),
            Err(DispatchError::InvalidState(_))
        ));
        assert!(check_transition(JobStatus::Started, JobStatus::Started).is_err());
    }

    #[test]
    fn recovering_and_resending_loop_back() {
        assert!(JobStatus::Recovering.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Recovering.can_transition_to(JobStatus::Stored));
        assert!(JobStatus::Resending.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Resending));
    }

    #[test]
    fn child_guard_requires_pending_parent() {
        assert!(check_child_allowed(JobStatus::Pending).is_ok());
        for parent in [JobStatus::Failed, JobStatus::Mined, JobStatus::Created] {
            assert!(matches!(
                check_child_allowed(parent),
                Err(DispatchError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn status_string_round_trip() {
        for status in [JobStatus::Created, JobStatus::Recovering, JobStatus::Stored] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }
}
