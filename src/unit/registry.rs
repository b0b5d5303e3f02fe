//! Canonical unit store: name resolution, the generational arena, the
//! symmetric dependency graph, change notification, and garbage collection.
//!
//! Units are addressed by a generational `UnitId` rather than a raw index
//! or pointer, so a GC'd unit leaves a recognizable tombstone behind instead
//! of dangling or silently aliasing a future unit in the same slot.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::unit::{ActiveState, Relation, Unit, UnitId, UnitKind};

enum Slot {
    Occupied { unit: Unit, generation: u32 },
    Vacant { generation: u32 },
}

/// Signal returned by `notify` describing what the registry did as a
/// result of an active-state change, so the caller (the manager's event
/// loop) knows what else needs driving — it does not drive the scheduler
/// or the control-plane signal bus itself, keeping the registry a pure
/// data-structure component.
#[derive(Debug, Default)]
pub struct NotifyEffects {
    /// Units whose installed job may now be runnable and should be
    /// reconsidered by the scheduler.
    pub wake_run_queue: Vec<UnitId>,
    /// Units whose `Triggers`/`TriggeredBy` peers should be reconsidered.
    pub retrigger: Vec<UnitId>,
}

pub struct UnitRegistry {
    slots: Vec<Slot>,
    by_name: HashMap<String, UnitId>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// `Resolve(name) → Unit`: returns the existing unit or creates a stub.
    pub fn resolve(&mut self, name: &str, default_kind: impl FnOnce() -> UnitKind) -> UnitId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let index = self.slots.len() as u32;
        let id = UnitId { index, generation: 0 };
        let unit = Unit::new_stub(id, name, default_kind());
        self.slots.push(Slot::Occupied { unit, generation: 0 });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, id: UnitId) -> Result<&Unit, CoreError> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { unit, generation }) if *generation == id.generation => Ok(unit),
            _ => Err(CoreError::UnknownUnit(id)),
        }
    }

    pub fn get_mut(&mut self, id: UnitId) -> Result<&mut Unit, CoreError> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { unit, generation }) if *generation == id.generation => Ok(unit),
            _ => Err(CoreError::UnknownUnit(id)),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<UnitId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unit> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { unit, .. } => Some(unit),
            Slot::Vacant { .. } => None,
        })
    }

    /// `AddDependency(a, R, b, reciprocal=true)`: inserts `R(a,b)` and, if
    /// `reciprocal`, `R⁻¹(b,a)` in one call so the symmetry invariant can
    /// never be observed half-applied.
    pub fn add_dependency(
        &mut self,
        a: UnitId,
        relation: Relation,
        b: UnitId,
        reciprocal: bool,
    ) -> Result<(), CoreError> {
        self.get(a)?;
        self.get(b)?;
        self.push_edge(a, relation, b);
        if reciprocal {
            self.push_edge(b, relation.partner(), a);
        }
        Ok(())
    }

    fn push_edge(&mut self, from: UnitId, relation: Relation, to: UnitId) {
        if let Ok(unit) = self.get_mut(from) {
            let set = unit.deps.entry(relation).or_default();
            if !set.contains(&to) {
                set.push(to);
            }
        }
    }

    /// `Notify(u, old_active, new_active, reload_success)`: records the
    /// transition and reports which peers need reconsidering. The caller
    /// is responsible for actually draining `wake_run_queue` into the
    /// scheduler and emitting the control-plane change signal — this
    /// component only ever mutates state it owns.
    pub fn notify(
        &mut self,
        u: UnitId,
        old_active: ActiveState,
        new_active: ActiveState,
        _reload_success: bool,
    ) -> Result<NotifyEffects, CoreError> {
        {
            let unit = self.get_mut(u)?;
            unit.active_state = new_active;
        }
        let mut effects = NotifyEffects::default();
        if old_active == new_active {
            return Ok(effects);
        }
        let unit = self.get(u)?;
        for rel in [Relation::Before, Relation::After] {
            for &peer in unit.deps_of(rel) {
                if let Ok(p) = self.get(peer) {
                    if p.has_installed_job() {
                        effects.wake_run_queue.push(peer);
                    }
                }
            }
        }
        for &peer in unit.deps_of(Relation::Triggers) {
            effects.retrigger.push(peer);
        }
        for &peer in unit.deps_of(Relation::TriggeredBy) {
            effects.retrigger.push(peer);
        }
        Ok(effects)
    }

    /// `CheckGC(u)`: collectible iff no installed job, no external
    /// references from non-collectible units, and the type's own
    /// `check_gc` agrees.
    pub fn check_gc(&self, u: UnitId, type_check_gc: bool) -> bool {
        let unit = match self.get(u) {
            Ok(unit) => unit,
            Err(_) => return true,
        };
        if unit.has_installed_job() || unit.nop_job.is_some() {
            return false;
        }
        if type_check_gc {
            return false;
        }
        !self.has_external_reference(u)
    }

    fn has_external_reference(&self, u: UnitId) -> bool {
        for referrer in self.iter() {
            if referrer.id == u {
                continue;
            }
            for (&rel, peers) in referrer.deps.iter() {
                if rel.is_ordering() {
                    continue;
                }
                if peers.contains(&u) {
                    return true;
                }
            }
        }
        false
    }

    /// Removes a unit that `check_gc` has determined is collectible.
    /// Tombstones the slot: `id` remains recognizably stale afterwards
    /// rather than being silently reassigned to a future unit.
    pub fn remove(&mut self, u: UnitId) -> Result<(), CoreError> {
        let name = self.get(u)?.canonical_name().to_string();
        self.by_name.remove(&name);
        let next_generation = u.generation.wrapping_add(1);
        self.slots[u.index as usize] = Slot::Vacant { generation: next_generation };
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_stub() -> UnitKind {
        UnitKind::Service
    }

    #[test]
    fn resolve_is_idempotent_by_name() {
        let mut reg = UnitRegistry::new();
        let a1 = reg.resolve("a.service", service_stub);
        let a2 = reg.resolve("a.service", service_stub);
        assert_eq!(a1, a2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn add_dependency_is_symmetric() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", service_stub);
        let b = reg.resolve("b.service", service_stub);
        reg.add_dependency(a, Relation::Requires, b, true).unwrap();
        assert!(reg.get(a).unwrap().deps_of(Relation::Requires).contains(&b));
        assert!(reg.get(b).unwrap().deps_of(Relation::RequiredBy).contains(&a));
    }

    #[test]
    fn non_reciprocal_dependency_only_sets_forward_edge() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", service_stub);
        let b = reg.resolve("b.service", service_stub);
        reg.add_dependency(a, Relation::Before, b, false).unwrap();
        assert!(reg.get(a).unwrap().deps_of(Relation::Before).contains(&b));
        assert!(reg.get(b).unwrap().deps_of(Relation::After).is_empty());
    }

    #[test]
    fn unit_with_external_reference_is_not_collectible() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", service_stub);
        let b = reg.resolve("b.service", service_stub);
        reg.add_dependency(b, Relation::Requires, a, true).unwrap();
        assert!(!reg.check_gc(a, false));
    }

    #[test]
    fn isolated_unit_with_no_job_is_collectible() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", service_stub);
        assert!(reg.check_gc(a, false));
    }

    #[test]
    fn removed_unit_leaves_a_stale_id_behind() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", service_stub);
        reg.remove(a).unwrap();
        assert!(reg.get(a).is_err());
        assert!(reg.by_name("a.service").is_none());
    }

    #[test]
    fn notify_wakes_before_and_after_neighbors_with_installed_jobs() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", service_stub);
        let b = reg.resolve("b.service", service_stub);
        reg.add_dependency(b, Relation::After, a, true).unwrap();
        reg.get_mut(b).unwrap().job = Some(crate::job::JobId(1));
        let effects = reg
            .notify(a, ActiveState::Activating, ActiveState::Active, true)
            .unwrap();
        assert_eq!(effects.wake_run_queue, vec![b]);
    }
}
