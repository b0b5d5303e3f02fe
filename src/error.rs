//! Error taxonomy, split by subsystem: core scheduling, transaction
//! building, control-plane calls, and the automount protocol each get
//! their own enum.

use thiserror::Error;

use crate::job::{JobId, JobType};
use crate::unit::UnitId;

/// Errors surfaced by the registry, the job algebra, and the scheduler.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unit {0:?} is unknown to the registry")]
    UnknownUnit(UnitId),
    #[error("job {0:?} is not installed")]
    JobNotInstalled(JobId),
    #[error("job types {0:?} and {1:?} cannot be merged")]
    UnmergeableJobTypes(JobType, JobType),
    #[error("dependency cycle detected and could not be broken: {0}")]
    Cycle(String),
    #[error("out of memory installing transaction")]
    OutOfMemory,
}

/// Errors surfaced while building and committing a transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("job for unit {0:?} conflicts with an installed irreversible job")]
    Irreversible(UnitId),
    #[error("transaction refused: installing would cancel job {0:?}, and mode is `fail`")]
    ModeRefusesCancel(JobId),
    #[error("isolate mode requires the unit to have allow_isolate set")]
    IsolateNotAllowed,
    #[error("ordering cycle could not be broken without removing a required edge")]
    UnbreakableCycle,
}

/// Errors returned to control-plane callers. No unit state change accompanies these.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no such unit: {0}")]
    NoSuchUnit(String),
    #[error("unit is masked: {0}")]
    UnitMasked(String),
    #[error("operation only permitted via dependency, not directly: {0}")]
    OnlyByDependency(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Errors local to the automount unit type.
#[derive(Debug, Error)]
pub enum AutomountError {
    #[error("mount point must not be \"/\"")]
    RootMountPoint,
    #[error("unit name does not match canonical transform of path {0}")]
    NameMismatch(String),
    #[error("{0} is already a kernel mount point")]
    AlreadyMounted(String),
    #[error("sibling mount unit not found for {0}")]
    NoSiblingMount(String),
    #[error("io error talking to /dev/autofs: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel errno {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("received malformed or unexpected autofs packet")]
    ProtocolViolation,
    #[error("attempted to send a positive status ({0}) to the kernel; this freezes autofs")]
    PositiveStatus(i32),
}
