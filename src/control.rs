//! The control-plane method/property/signal surface, exposed as a plain
//! Rust trait the manager implements, plus an optional `zbus` adapter
//! wrapping it onto the historical `org.freedesktop.systemd1` names.

use async_trait::async_trait;

use crate::error::ControlError;
use crate::transaction::TransactionMode;
use crate::unit::UnitId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillWho {
    Main,
    Control,
    All,
}

/// A job's D-Bus-shaped object path, doubling as the external observer's
/// handle. Kept distinct from `JobId` so the control-plane surface doesn't
/// leak the internal id representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPath(pub String);

impl JobPath {
    /// A Restart whose Stop half finished converts the same job in place to
    /// a Start — no new `JobNew` signal is fired, so this path is stable
    /// across that rewrite even though the job's reported `JobType` is not.
    /// Callers must re-read the type rather than cache it.
    pub fn for_job(id: crate::job::JobId) -> Self {
        JobPath(format!("/org/freedesktop/systemd1/job/{}", id.0))
    }
}

/// The method surface a unit exposes to callers. Mode strings are typed as
/// `TransactionMode` rather than raw strings at this boundary; the zbus
/// adapter is responsible for parsing the wire string into one.
#[async_trait(?Send)]
pub trait ControlPlane {
    async fn start(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn stop(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn reload(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn try_restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn reload_or_restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn reload_or_try_restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError>;
    async fn kill(&mut self, unit: &str, who: KillWho, signo: i32) -> Result<(), ControlError>;
    async fn reset_failed(&mut self, unit: &str) -> Result<(), ControlError>;
}

/// The injected authorization hook the core consults before executing any
/// control-plane method. The default admits everything; a real deployment
/// supplies a hook invoked from the method dispatch path, kept separate
/// from the job/unit state machine itself.
pub trait AccessCheck {
    fn check(&self, caller: &str, unit: &str, method: &str) -> Result<(), ControlError>;
}

pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn check(&self, _caller: &str, _unit: &str, _method: &str) -> Result<(), ControlError> {
        Ok(())
    }
}

/// Implements `ControlPlane` over a `Manager`, translating control-plane
/// method calls into `AddJob` transactions and resolving unit names through
/// the registry first (`NoSuchUnit`/`UnitMasked`/`OnlyByDependency`).
pub struct ManagerControlPlane<A: AccessCheck> {
    pub manager: crate::manager::Manager,
    pub access: A,
}

impl<A: AccessCheck> ManagerControlPlane<A> {
    pub fn new(manager: crate::manager::Manager, access: A) -> Self {
        Self { manager, access }
    }

    fn resolve_existing(&self, unit: &str) -> Result<UnitId, ControlError> {
        let id = self
            .manager
            .registry
            .by_name(unit)
            .ok_or_else(|| ControlError::NoSuchUnit(unit.to_string()))?;
        let loaded = self
            .manager
            .registry
            .get(id)
            .map_err(|_| ControlError::NoSuchUnit(unit.to_string()))?;
        if loaded.load_state == crate::unit::LoadState::Masked {
            return Err(ControlError::UnitMasked(unit.to_string()));
        }
        Ok(id)
    }

    fn add_job(
        &mut self,
        caller: &str,
        unit: &str,
        method: &str,
        job_type: crate::job::JobType,
        mode: TransactionMode,
    ) -> Result<JobPath, ControlError> {
        self.access.check(caller, unit, method)?;
        let id = self.resolve_existing(unit)?;
        let job = self.manager.add_job(id, job_type, mode)?;
        Ok(JobPath::for_job(job))
    }
}

#[async_trait(?Send)]
impl<A: AccessCheck> ControlPlane for ManagerControlPlane<A> {
    async fn start(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "Start", crate::job::JobType::Start, mode)
    }

    async fn stop(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "Stop", crate::job::JobType::Stop, mode)
    }

    async fn reload(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "Reload", crate::job::JobType::Reload, mode)
    }

    async fn restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "Restart", crate::job::JobType::Restart, mode)
    }

    async fn try_restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "TryRestart", crate::job::JobType::TryRestart, mode)
    }

    async fn reload_or_restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "ReloadOrRestart", crate::job::JobType::ReloadOrStart, mode)
    }

    async fn reload_or_try_restart(&mut self, unit: &str, mode: TransactionMode) -> Result<JobPath, ControlError> {
        self.add_job("", unit, "ReloadOrTryRestart", crate::job::JobType::TryReload, mode)
    }

    async fn kill(&mut self, unit: &str, who: KillWho, signo: i32) -> Result<(), ControlError> {
        self.access.check("", unit, "Kill")?;
        let id = self.resolve_existing(unit)?;
        let unit_impl = self.manager.registry.get_mut(id).map_err(|e| ControlError::Transaction(e.into()))?;
        let kill_who = match who {
            KillWho::Main => crate::unit::KillWho::Main,
            KillWho::Control => crate::unit::KillWho::Control,
            KillWho::All => crate::unit::KillWho::All,
        };
        match &mut unit_impl.kind {
            crate::unit::UnitKind::Automount(state) => {
                crate::unit::UnitImpl::kill(state, kill_who, signo).map_err(|e| ControlError::Transaction(e.into()))
            }
            _ => Ok(()),
        }
    }

    async fn reset_failed(&mut self, unit: &str) -> Result<(), ControlError> {
        self.access.check("", unit, "ResetFailed")?;
        let id = self.resolve_existing(unit)?;
        let unit_impl = self.manager.registry.get_mut(id).map_err(|e| ControlError::Transaction(e.into()))?;
        if let crate::unit::UnitKind::Automount(state) = &mut unit_impl.kind {
            crate::unit::UnitImpl::reset_failed(state);
        }
        Ok(())
    }
}

/// A thin `zbus` server-side adapter wrapping `ControlPlane` onto the
/// historical `org.freedesktop.systemd1.Manager` interface name. Left as a
/// shape rather than a full implementation: this crate never requires a bus
/// to be present, and actually registering an object server is a deployment
/// concern of the daemon binary, not the core.
#[cfg(feature = "zbus-adapter")]
pub mod dbus {
    use zbus::dbus_interface;

    use super::*;

    pub struct ManagerDbusAdapter<A: AccessCheck + 'static> {
        pub inner: ManagerControlPlane<A>,
    }

    #[dbus_interface(name = "org.freedesktop.systemd1.Manager")]
    impl<A: AccessCheck + 'static> ManagerDbusAdapter<A> {
        async fn start_unit(&mut self, name: String, mode: String) -> zbus::fdo::Result<String> {
            let mode = parse_mode(&mode);
            let path = self
                .inner
                .start(&name, mode)
                .await
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            Ok(path.0)
        }
    }

    fn parse_mode(s: &str) -> TransactionMode {
        match s {
            "replace" => TransactionMode::Replace,
            "replace-irreversibly" => TransactionMode::ReplaceIrreversibly,
            "isolate" => TransactionMode::Isolate,
            "flush" => TransactionMode::Flush,
            "ignore-dependencies" => TransactionMode::IgnoreDependencies,
            "ignore-requirements" => TransactionMode::IgnoreRequirements,
            _ => TransactionMode::Fail,
        }
    }
}
