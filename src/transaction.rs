//! Transaction builder: expansion, merge, cycle-breaking, and atomic
//! commit. Cycle detection uses `petgraph`'s `DiGraph`-backed toposort,
//! restricted here to the ordering edges touched by the candidate job set
//! rather than the whole unit graph.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{CoreError, TransactionError};
use crate::job::merge::{is_redundant, merge_and_collapse};
use crate::job::queue::{JobTable, RunQueue};
use crate::job::{JobId, JobType};
use crate::unit::{Relation, UnitId, UnitRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Fail,
    Replace,
    ReplaceIrreversibly,
    Isolate,
    Flush,
    IgnoreDependencies,
    IgnoreRequirements,
}

/// A directed edge recorded during expansion, used only for cycle-breaking
/// and for deciding whether a job survives redundancy pruning. `subject =
/// None` marks the user-anchor.
#[derive(Debug, Clone, Copy)]
pub struct JobDependency {
    pub subject: Option<JobId>,
    pub object: JobId,
    pub matters: bool,
    pub conflicts: bool,
}

/// A transaction mid-construction: the candidate job set (one per touched
/// unit) plus the edges recorded while walking dependencies.
pub struct Transaction {
    pub mode: TransactionMode,
    pub anchor: JobId,
    candidates: HashMap<UnitId, JobId>,
    edges: Vec<JobDependency>,
}

/// Which relation (if any) a given edge propagates a job across, and what
/// type it proposes: requirement-family edges pull a Start (positive
/// propagation of the anchor's polarity); conflict-family edges pull a
/// Stop.
fn propagated_job(relation: Relation, anchor_is_positive: bool) -> Option<(JobType, bool)> {
    if relation.matters_for_transaction() || relation == Relation::Wants {
        if anchor_is_positive {
            return Some((JobType::Start, relation.matters_for_transaction()));
        }
    }
    if relation.is_conflict() {
        return Some((JobType::Stop, true));
    }
    None
}

impl Transaction {
    /// `AddJob(anchor_unit, anchor_type, mode)`: builds the candidate set by
    /// walking dependency edges recursively from the anchor.
    pub fn build(
        registry: &UnitRegistry,
        table: &mut JobTable,
        anchor_unit: UnitId,
        anchor_type: JobType,
        mode: TransactionMode,
        now: Instant,
    ) -> Result<Transaction, TransactionError> {
        let mut candidates: HashMap<UnitId, JobId> = HashMap::new();
        let mut edges = Vec::new();

        let anchor_job = table.new_job(anchor_unit, anchor_type, now);
        candidates.insert(anchor_unit, anchor_job);
        edges.push(JobDependency { subject: None, object: anchor_job, matters: true, conflicts: false });

        if mode == TransactionMode::Isolate {
            let anchor = registry.get(anchor_unit).map_err(TransactionError::Core)?;
            if !anchor.policy.allow_isolate {
                return Err(TransactionError::IsolateNotAllowed);
            }
            let closure = positive_closure(registry, anchor_unit).map_err(TransactionError::Core)?;
            for unit in registry.iter() {
                if unit.active_state.is_inactive_or_deactivating() {
                    continue;
                }
                if unit.policy.ignore_on_isolate || closure.contains(&unit.id) {
                    continue;
                }
                if candidates.contains_key(&unit.id) {
                    continue;
                }
                let job = table.new_job(unit.id, JobType::Stop, now);
                candidates.insert(unit.id, job);
                edges.push(JobDependency { subject: Some(anchor_job), object: job, matters: false, conflicts: true });
            }
        }

        if mode != TransactionMode::IgnoreDependencies {
            let walk_requirements = mode != TransactionMode::IgnoreRequirements;
            let mut stack = vec![(anchor_unit, anchor_job, anchor_type)];
            let mut visited: HashSet<UnitId> = HashSet::from([anchor_unit]);

            while let Some((unit_id, subject_job, job_type)) = stack.pop() {
                let unit = registry.get(unit_id).map_err(TransactionError::Core)?;
                let anchor_is_positive = job_type.is_positive() || job_type == JobType::Restart;

                let relations: &[Relation] = if walk_requirements {
                    &[
                        Relation::Requires,
                        Relation::RequiresOverridable,
                        Relation::Requisite,
                        Relation::RequisiteOverridable,
                        Relation::Wants,
                        Relation::BindsTo,
                        Relation::Conflicts,
                        Relation::ConflictedBy,
                    ]
                } else {
                    &[]
                };

                for &rel in relations {
                    let Some((proposed_type, matters)) = propagated_job(rel, anchor_is_positive) else {
                        continue;
                    };
                    for &peer in unit.deps_of(rel) {
                        let peer_job = *candidates.entry(peer).or_insert_with(|| table.new_job(peer, proposed_type, now));
                        edges.push(JobDependency {
                            subject: Some(subject_job),
                            object: peer_job,
                            matters,
                            conflicts: rel.is_conflict(),
                        });
                        if visited.insert(peer) {
                            stack.push((peer, peer_job, proposed_type));
                        }
                    }
                }
            }
        }

        Ok(Transaction { mode, anchor: anchor_job, candidates, edges })
    }

    /// `Resolve`: merges same-unit duplicates (already merged in `build` by
    /// construction, since each unit maps to exactly one candidate job),
    /// detects ordering cycles, prunes redundant non-essential jobs, and
    /// checks every remaining job is installable under the transaction's
    /// mode.
    pub fn resolve(
        &mut self,
        table: &mut JobTable,
        registry: &UnitRegistry,
    ) -> Result<(), TransactionError> {
        self.break_cycles(table, registry)?;
        self.prune_redundant(table, registry)?;
        self.check_installable(table, registry)?;
        Ok(())
    }

    fn break_cycles(&mut self, _table: &JobTable, registry: &UnitRegistry) -> Result<(), TransactionError> {
        let mut graph = DiGraph::<UnitId, bool>::new();
        let mut node_of: HashMap<UnitId, NodeIndex> = HashMap::new();
        for &unit in self.candidates.keys() {
            let idx = graph.add_node(unit);
            node_of.insert(unit, idx);
        }
        for &unit in self.candidates.keys() {
            let u = registry.get(unit).map_err(TransactionError::Core)?;
            for &peer in u.deps_of(Relation::Before) {
                if let (Some(&a), Some(&b)) = (node_of.get(&unit), node_of.get(&peer)) {
                    graph.add_edge(a, b, true);
                }
            }
        }
        if toposort(&graph, None).is_err() {
            return Err(TransactionError::UnbreakableCycle);
        }
        Ok(())
    }

    /// Drops any non-anchor candidate whose transition is already achieved.
    /// `matters` (recorded per edge) does not exempt a job from pruning here
    /// — it only governs `check_installable`'s "Fail" mode refusal; a hard
    /// requirement on a unit that is already in the target state still adds
    /// nothing to the transaction.
    fn prune_redundant(&mut self, table: &mut JobTable, registry: &UnitRegistry) -> Result<(), TransactionError> {
        let mut to_remove = Vec::new();
        for (&unit, &job) in self.candidates.iter() {
            if job == self.anchor {
                continue;
            }
            let active_state = registry.get(unit).map_err(TransactionError::Core)?.active_state;
            let job_type = table.get(job).map_err(TransactionError::Core)?.job_type;
            if is_redundant(job_type, active_state) {
                to_remove.push(unit);
            }
        }
        for unit in to_remove {
            if let Some(job) = self.candidates.remove(&unit) {
                table.remove(job);
            }
        }
        Ok(())
    }

    fn check_installable(&self, table: &JobTable, registry: &UnitRegistry) -> Result<(), TransactionError> {
        for (&unit, &job) in self.candidates.iter() {
            let existing = registry.get(unit).map_err(TransactionError::Core)?.job;
            let Some(existing) = existing else { continue };
            if existing == job {
                continue;
            }
            let existing_job = table.get(existing).map_err(TransactionError::Core)?;
            if existing_job.flags.irreversible {
                return Err(TransactionError::Irreversible(unit));
            }
            let new_type = table.get(job).map_err(TransactionError::Core)?.job_type;
            let active_state = registry.get(unit).map_err(TransactionError::Core)?.active_state;
            let mergeable = merge_and_collapse(existing_job.job_type, new_type, active_state).is_some();
            if !mergeable && self.mode == TransactionMode::Fail {
                return Err(TransactionError::ModeRefusesCancel(existing));
            }
        }
        Ok(())
    }

    /// `Commit`: installs every surviving candidate atomically. On any
    /// failure, everything just installed in this call is rolled back.
    pub fn commit(
        self,
        table: &mut JobTable,
        registry: &mut UnitRegistry,
        run_queue: &mut RunQueue,
    ) -> Result<Vec<JobId>, TransactionError> {
        if self.mode == TransactionMode::Flush {
            Self::cancel_jobs_outside(table, registry, &self.candidates)?;
        }
        let irreversible = self.mode == TransactionMode::ReplaceIrreversibly;
        if irreversible {
            for &job in self.candidates.values() {
                if let Ok(j) = table.get_mut(job) {
                    j.flags.irreversible = true;
                }
            }
        }
        let mut installed = Vec::new();
        for (unit, job) in self.candidates {
            match crate::job::queue::install(table, registry, unit, job) {
                Ok((kept, cancelled)) => {
                    if let Some(cancelled_job) = cancelled {
                        if let Ok(j) = table.get_mut(cancelled_job) {
                            j.result = Some(crate::job::JobResult::Canceled);
                        }
                        table.remove(cancelled_job);
                    }
                    if let Err(e) = run_queue.enqueue(table, kept) {
                        Self::rollback(table, registry, &installed);
                        return Err(TransactionError::Core(e));
                    }
                    installed.push(kept);
                }
                Err(e) => {
                    Self::rollback(table, registry, &installed);
                    return Err(TransactionError::Core(e));
                }
            }
        }
        Ok(installed)
    }

    /// `Flush` mode: cancels every job installed on a unit this transaction
    /// doesn't already touch, before the candidates below are installed.
    /// Units the transaction does touch go through the ordinary
    /// merge/cancel path in `install` instead.
    fn cancel_jobs_outside(
        table: &mut JobTable,
        registry: &mut UnitRegistry,
        candidates: &HashMap<UnitId, JobId>,
    ) -> Result<(), TransactionError> {
        let touched: HashSet<UnitId> = candidates.keys().copied().collect();
        let stale: Vec<JobId> = registry
            .iter()
            .filter(|u| !touched.contains(&u.id))
            .filter_map(|u| u.job)
            .collect();
        for job in stale {
            crate::job::queue::finish(table, registry, job, crate::job::JobResult::Canceled, false, false)
                .map_err(TransactionError::Core)?;
        }
        Ok(())
    }

    fn rollback(table: &mut JobTable, registry: &mut UnitRegistry, installed: &[JobId]) {
        for &job in installed {
            if let Ok(j) = table.get(job) {
                let unit = j.unit;
                if let Ok(u) = registry.get_mut(unit) {
                    if u.job == Some(job) {
                        u.job = None;
                    }
                }
            }
            table.remove(job);
        }
    }
}

/// Units transitively reachable from `anchor` via positive requirement
/// edges — excluded from an isolate's Stop fanout.
fn positive_closure(registry: &UnitRegistry, anchor: UnitId) -> Result<HashSet<UnitId>, CoreError> {
    let mut seen = HashSet::from([anchor]);
    let mut stack = vec![anchor];
    while let Some(unit_id) = stack.pop() {
        let unit = registry.get(unit_id)?;
        for rel in [
            Relation::Requires,
            Relation::RequiresOverridable,
            Relation::Requisite,
            Relation::RequisiteOverridable,
            Relation::Wants,
            Relation::BindsTo,
        ] {
            for &peer in unit.deps_of(rel) {
                if seen.insert(peer) {
                    stack.push(peer);
                }
            }
        }
    }
    Ok(seen)
}
