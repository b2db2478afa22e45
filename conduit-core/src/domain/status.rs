//! Job and pipeline status machine
//!
//! Jobs move between statuses only through [`JobEvent::transition`]. Stages and
//! pipelines never transition on their own: their status is always derived from
//! the statuses of their jobs with [`composite_status`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status shared by jobs, stages and pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Created,
        Status::Pending,
        Status::Running,
        Status::Success,
        Status::Failed,
        Status::Canceled,
        Status::Skipped,
        Status::Manual,
        Status::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
            Status::Skipped => "skipped",
            Status::Manual => "manual",
            Status::Scheduled => "scheduled",
        }
    }

    /// Terminal statuses a gate can be evaluated against
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failed | Status::Canceled | Status::Skipped
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::Running)
    }

    pub fn is_cancelable(&self) -> bool {
        JobEvent::Cancel.from_states().contains(self)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// Events that move a job between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    Enqueue,
    Run,
    Succeed,
    Drop,
    Cancel,
    Skip,
    Actionize,
    Schedule,
    Process,
    /// Resets a bridge back to pending, regardless of its current status.
    Requeue,
}

impl JobEvent {
    /// Statuses the event may be fired from
    pub fn from_states(&self) -> &'static [Status] {
        use Status::*;
        match self {
            JobEvent::Enqueue => &[Created, Skipped, Manual, Scheduled],
            JobEvent::Run => &[Pending],
            JobEvent::Succeed => &[Created, Pending, Running],
            JobEvent::Drop | JobEvent::Cancel => &[Created, Pending, Running, Manual, Scheduled],
            JobEvent::Skip | JobEvent::Actionize | JobEvent::Schedule => &[Created],
            JobEvent::Process => &[Skipped, Manual],
            JobEvent::Requeue => &Status::ALL,
        }
    }

    pub fn to_state(&self) -> Status {
        match self {
            JobEvent::Enqueue | JobEvent::Requeue => Status::Pending,
            JobEvent::Run => Status::Running,
            JobEvent::Succeed => Status::Success,
            JobEvent::Drop => Status::Failed,
            JobEvent::Cancel => Status::Canceled,
            JobEvent::Skip => Status::Skipped,
            JobEvent::Actionize => Status::Manual,
            JobEvent::Schedule => Status::Scheduled,
            JobEvent::Process => Status::Created,
        }
    }

    pub fn can_fire(&self, from: Status) -> bool {
        self.from_states().contains(&from)
    }

    pub fn transition(&self, from: Status) -> Result<Status, TransitionError> {
        if self.can_fire(from) {
            Ok(self.to_state())
        } else {
            Err(TransitionError { event: *self, from })
        }
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobEvent::Enqueue => "enqueue",
            JobEvent::Run => "run",
            JobEvent::Succeed => "succeed",
            JobEvent::Drop => "drop",
            JobEvent::Cancel => "cancel",
            JobEvent::Skip => "skip",
            JobEvent::Actionize => "actionize",
            JobEvent::Schedule => "schedule",
            JobEvent::Process => "process",
            JobEvent::Requeue => "requeue",
        };
        f.write_str(name)
    }
}

/// An event fired from a status that does not allow it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {event} a job with status {from}")]
pub struct TransitionError {
    pub event: JobEvent,
    pub from: Status,
}

/// Aggregate status of a group of jobs
///
/// Each entry is `(status, allow_failure)`. Failed, canceled and manual entries
/// that allow failure are *ignored*: they never drag the aggregate down.
/// Returns `None` for an empty group.
pub fn composite_status<I>(entries: I) -> Option<Status>
where
    I: IntoIterator<Item = (Status, bool)>,
{
    let mut counts = StatusCounts::default();
    for (status, allow_failure) in entries {
        counts.add(status, allow_failure);
    }
    counts.composite()
}

#[derive(Debug, Default)]
struct StatusCounts {
    by_status: [usize; 9],
    ignored: usize,
    total: usize,
}

impl StatusCounts {
    fn add(&mut self, status: Status, allow_failure: bool) {
        self.total += 1;
        let ignorable = matches!(status, Status::Failed | Status::Canceled | Status::Manual);
        if allow_failure && ignorable {
            self.ignored += 1;
        } else {
            self.by_status[status.index()] += 1;
        }
    }

    /// Every non-ignored entry has one of `statuses`
    fn only_of(&self, statuses: &[Status]) -> bool {
        let matched: usize = statuses.iter().map(|s| self.by_status[s.index()]).sum();
        matched + self.ignored == self.total
    }

    fn any_of(&self, statuses: &[Status]) -> bool {
        statuses.iter().any(|s| self.by_status[s.index()] > 0)
    }

    fn composite(&self) -> Option<Status> {
        use Status::*;
        if self.total == 0 {
            return None;
        }

        let status = if self.only_of(&[Skipped]) {
            Skipped
        } else if self.only_of(&[Success, Skipped]) {
            Success
        } else if self.only_of(&[Created]) {
            Created
        } else if self.only_of(&[Canceled, Success, Skipped]) {
            Canceled
        } else if self.only_of(&[Pending, Created, Skipped]) {
            Pending
        } else if self.any_of(&[Running, Pending]) {
            Running
        } else if self.any_of(&[Manual]) {
            Manual
        } else if self.any_of(&[Scheduled]) {
            Scheduled
        } else if self.any_of(&[Created]) {
            Running
        } else {
            Failed
        };

        Some(status)
    }
}
