//! The polymorphic unit contract, realized as a closed sum type dispatched
//! through one trait instead of a C-style function-pointer vtable — adding
//! a unit kind means a new enum variant and match arm, not a new trait
//! object.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::unit::automount::{AutomountLifecycle, AutomountResult, AutomountState};
use crate::unit::{ActiveState, Unit};

/// The only synchronous signal `start`/`stop`/`reload` give the job core;
/// everything else arrives later through `Manager::notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// Queued; will report completion asynchronously via `Notify`.
    OkQueued,
    /// `EALREADY` — already in (or transitioning to) the requested state.
    Already,
    /// `EBADR` — refused; do nothing.
    Refused,
    /// `ENOEXEC` — invalid configuration.
    Invalid,
    /// `EPROTO` — an assertion the unit requires failed.
    AssertFailed,
    /// `ENOTSUP` — the unit type doesn't support this transition.
    Unsupported,
    /// `EAGAIN` — try again later; job stays Waiting.
    RetryLater,
    /// Some other failure.
    Failed(String),
}

/// Which unit kind a `Unit` is. One variant is implemented (`Automount`);
/// the rest are named extension points, treated as external collaborators
/// the core doesn't actually drive.
#[derive(Debug, Clone)]
pub enum UnitKind {
    Automount(AutomountState),
    Service,
    Mount,
    Socket,
    Timer,
    Slice,
}

/// Operations every unit kind must answer. Optional hooks (`kill`,
/// `get_timeout`, `status_message_formats`) default to no-ops so that
/// implementing a new kind only requires overriding what it actually uses.
#[async_trait(?Send)]
pub trait UnitImpl {
    async fn start(&mut self) -> Result<StartResult, CoreError>;
    async fn stop(&mut self) -> Result<StartResult, CoreError>;
    async fn reload(&mut self) -> Result<StartResult, CoreError>;
    fn active_state(&self) -> ActiveState;
    fn sub_state_to_string(&self) -> String;
    fn check_gc(&self) -> bool {
        false
    }
    fn reset_failed(&mut self) {}
    fn kill(&mut self, _who: KillWho, _signo: i32) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillWho {
    Main,
    Control,
    All,
}

#[async_trait(?Send)]
impl UnitImpl for AutomountState {
    async fn start(&mut self) -> Result<StartResult, CoreError> {
        AutomountState::start(self)
    }

    async fn stop(&mut self) -> Result<StartResult, CoreError> {
        AutomountState::stop(self)
    }

    async fn reload(&mut self) -> Result<StartResult, CoreError> {
        // Reload has no meaning for an automount: there is no
        // configuration to re-read mid-flight, so it reports the same
        // "unsupported" signal that turns into job result `Unsupported`.
        Ok(StartResult::Unsupported)
    }

    fn active_state(&self) -> ActiveState {
        self.lifecycle.active_state()
    }

    fn sub_state_to_string(&self) -> String {
        match self.lifecycle {
            AutomountLifecycle::Dead => "dead",
            AutomountLifecycle::Waiting => "waiting",
            AutomountLifecycle::Running => "running",
            AutomountLifecycle::Failed => "failed",
        }
        .to_string()
    }

    fn check_gc(&self) -> bool {
        self.lifecycle != AutomountLifecycle::Dead
    }

    fn reset_failed(&mut self) {
        if self.lifecycle == AutomountLifecycle::Failed {
            self.lifecycle = AutomountLifecycle::Dead;
            self.result = AutomountResult::Success;
        }
    }
}

/// Dispatches to the unit kind's `UnitImpl`. Other kinds report
/// `Unsupported` rather than silently no-op, since pretending to start a
/// unit type the core doesn't actually drive would violate the contract
/// that the returned `StartResult` is the only synchronous signal the job
/// core gets.
pub async fn dispatch_start(unit: &mut Unit) -> Result<StartResult, CoreError> {
    match &mut unit.kind {
        UnitKind::Automount(state) => state.start().await,
        _ => Ok(StartResult::Unsupported),
    }
}

pub async fn dispatch_stop(unit: &mut Unit) -> Result<StartResult, CoreError> {
    match &mut unit.kind {
        UnitKind::Automount(state) => state.stop().await,
        _ => Ok(StartResult::Unsupported),
    }
}

pub async fn dispatch_reload(unit: &mut Unit) -> Result<StartResult, CoreError> {
    match &mut unit.kind {
        UnitKind::Automount(state) => state.reload().await,
        _ => Ok(StartResult::Unsupported),
    }
}
