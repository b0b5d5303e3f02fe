//! The job object and its merging algebra.

pub mod merge;
pub mod queue;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::unit::UnitId;

/// Monotonic per-manager job id. Unlike `UnitId` this is never reused at
/// all, not even as a tombstoned generation — job ids are cheap (a `u32`
/// counter) and a Restart-turned-Start needs to keep its id stable across
/// that in-place rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Start,
    VerifyActive,
    Stop,
    Reload,
    RestartDependencies,
    Restart,
    TryRestart,
    ReloadOrStart,
    TryReload,
    Nop,
}

impl JobType {
    /// "Positive" types require their `After` peers to have settled before
    /// running; Stop and friends are negative and never wait on `After`.
    pub fn is_positive(self) -> bool {
        matches!(self, JobType::Start | JobType::VerifyActive | JobType::Reload)
    }

    /// Whether this type counts as one of the five mergeable base types.
    /// Transient transaction-only types (`RestartDependencies`,
    /// `TryRestart`, `ReloadOrStart`, `TryReload`) are never installed as-is.
    pub fn is_mergeable_base(self) -> bool {
        matches!(
            self,
            JobType::Start | JobType::VerifyActive | JobType::Stop | JobType::Reload | JobType::Restart
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Done,
    Canceled,
    Timeout,
    Failed,
    Dependency,
    Skipped,
    Invalid,
    Assert,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    pub override_: bool,
    pub irreversible: bool,
    pub ignore_order: bool,
    pub reloaded: bool,
    pub sent_dbus_new: bool,
}

/// A pending or in-flight operation on one unit.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub unit: UnitId,
    pub job_type: JobType,
    pub state: JobState,
    pub result: Option<JobResult>,
    pub flags: JobFlags,
    pub installed: bool,
    pub in_run_queue: bool,
    pub begin: Instant,
    pub timeout: Option<Duration>,
}

impl Job {
    pub fn new(id: JobId, unit: UnitId, job_type: JobType, now: Instant) -> Self {
        Self {
            id,
            unit,
            job_type,
            state: JobState::Waiting,
            result: None,
            flags: JobFlags::default(),
            installed: false,
            in_run_queue: false,
            begin: now,
            timeout: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}
