//! Unit data model, registry, and the polymorphic state-machine contract.

pub mod automount;
pub mod registry;
pub mod relation;
pub mod vtable;

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::job::JobId;

pub use registry::UnitRegistry;
pub use relation::Relation;
pub use vtable::{KillWho, StartResult, UnitImpl, UnitKind};

/// Stable address of a unit in the manager's arena: a generational index.
/// `index` names the slot, `generation` distinguishes a slot from whatever
/// unit previously lived there, so a `UnitId` captured before a GC pass
/// either still resolves to the same unit or is recognizably stale — never
/// silently aliased onto an unrelated unit. Units and jobs refer to each
/// other only by id, never by `Rc`/`&Unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Stub,
    Loaded,
    NotFound,
    Error,
    Masked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveState {
    Inactive,
    Activating,
    Active,
    Reloading,
    Deactivating,
    Failed,
}

impl ActiveState {
    pub fn is_inactive_or_deactivating(self) -> bool {
        matches!(self, ActiveState::Inactive | ActiveState::Deactivating)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Timestamps {
    pub inactive_exit: Option<SystemTime>,
    pub active_enter: Option<SystemTime>,
    pub active_exit: Option<SystemTime>,
    pub inactive_enter: Option<SystemTime>,
    pub condition: Option<SystemTime>,
    pub assert: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct PolicyFlags {
    pub refuse_manual_start: bool,
    pub refuse_manual_stop: bool,
    pub allow_isolate: bool,
    pub ignore_on_isolate: bool,
    pub default_dependencies: bool,
    pub stop_when_unneeded: bool,
    pub transient: bool,
}

impl Default for PolicyFlags {
    fn default() -> Self {
        Self {
            refuse_manual_start: false,
            refuse_manual_stop: false,
            allow_isolate: false,
            ignore_on_isolate: false,
            default_dependencies: true,
            stop_when_unneeded: false,
            transient: false,
        }
    }
}

/// One managed resource with a lifecycle.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: UnitId,
    pub names: Vec<String>,
    pub load_state: LoadState,
    pub active_state: ActiveState,
    pub sub_state: String,
    pub deps: HashMap<Relation, Vec<UnitId>>,
    pub job: Option<JobId>,
    pub nop_job: Option<JobId>,
    pub policy: PolicyFlags,
    pub timestamps: Timestamps,
    pub job_timeout: Duration,
    pub job_timeout_action: JobTimeoutAction,
    pub kind: UnitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTimeoutAction {
    None,
    Reboot,
    RebootForce,
}

impl Unit {
    pub fn new_stub(id: UnitId, canonical_name: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            id,
            names: vec![canonical_name.into()],
            load_state: LoadState::Stub,
            active_state: ActiveState::Inactive,
            sub_state: "dead".to_string(),
            deps: HashMap::new(),
            job: None,
            nop_job: None,
            policy: PolicyFlags::default(),
            timestamps: Timestamps::default(),
            job_timeout: Duration::from_secs(90),
            job_timeout_action: JobTimeoutAction::None,
            kind,
        }
    }

    pub fn canonical_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("")
    }

    pub fn deps_of(&self, r: Relation) -> &[UnitId] {
        self.deps.get(&r).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_installed_job(&self) -> bool {
        self.job.is_some()
    }
}
