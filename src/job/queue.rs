//! The job table, the run queue, and `Run`/`Finish`: install/merge, the
//! runnability predicate, dispatch to a unit's state machine, and the
//! completion cascade, all addressed through `UnitId`/`JobId` arena lookups
//! rather than raw pointers.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::error::CoreError;
use crate::job::merge::{is_redundant, merge_and_collapse};
use crate::job::{Job, JobFlags, JobId, JobResult, JobState, JobType};
use crate::unit::{ActiveState, Relation, StartResult, UnitId, UnitRegistry};

/// Owns every job, installed or not, keyed by its never-reused id.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    next_id: u32,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `NewJob(unit, type)`: allocates an id, does not install.
    pub fn new_job(&mut self, unit: UnitId, job_type: JobType, now: Instant) -> JobId {
        let id = JobId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.jobs.insert(id, Job::new(id, unit, job_type, now));
        id
    }

    pub fn get(&self, id: JobId) -> Result<&Job, CoreError> {
        self.jobs.get(&id).ok_or(CoreError::JobNotInstalled(id))
    }

    pub fn get_mut(&mut self, id: JobId) -> Result<&mut Job, CoreError> {
        self.jobs.get_mut(&id).ok_or(CoreError::JobNotInstalled(id))
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.jobs.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// The manager-global FIFO of installed Waiting jobs eligible for execution.
/// Membership is a functional subset of the `in_run_queue` flag on each job:
/// `enqueue` and `dequeue` keep both in lockstep.
#[derive(Debug, Default)]
pub struct RunQueue {
    queue: VecDeque<JobId>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, table: &mut JobTable, id: JobId) -> Result<(), CoreError> {
        let job = table.get_mut(id)?;
        if !job.in_run_queue {
            job.in_run_queue = true;
            self.queue.push_back(id);
        }
        Ok(())
    }

    /// Pops the head, clearing its `in_run_queue` flag before returning:
    /// removal from the queue clears the flag before any other mutation.
    pub fn dequeue(&mut self, table: &mut JobTable) -> Option<JobId> {
        while let Some(id) = self.queue.pop_front() {
            if let Ok(job) = table.get_mut(id) {
                job.in_run_queue = false;
                return Some(id);
            }
            // Job was removed from the table since it was enqueued; skip.
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// `Install(unit, new)`: merges `new` into whatever is already installed on
/// `unit`. Returns the job id left installed, and the id of any
/// job that was cancelled in the process (for the caller to finish with
/// `Canceled`).
pub fn install(
    table: &mut JobTable,
    registry: &mut UnitRegistry,
    unit: UnitId,
    new: JobId,
) -> Result<(JobId, Option<JobId>), CoreError> {
    let active_state = registry.get(unit)?.active_state;
    let existing = registry.get(unit)?.job;

    let Some(uj) = existing else {
        registry.get_mut(unit)?.job = Some(new);
        return Ok((new, None));
    };

    let uj_type = table.get(uj)?.job_type;
    let new_type = table.get(new)?.job_type;

    match merge_and_collapse(uj_type, new_type, active_state) {
        None => {
            // Conflict: the older job is cancelled, the new one installed.
            registry.get_mut(unit)?.job = Some(new);
            Ok((new, Some(uj)))
        }
        Some(merged) => {
            let new_flags = table.get(new)?.flags;
            let uj_job = table.get_mut(uj)?;
            let was_running = uj_job.is_running();
            uj_job.flags = merge_flags(uj_job.flags, new_flags);

            if !was_running {
                uj_job.job_type = merged;
                Ok((uj, None))
            } else if crate::job::merge::is_late_merge_safe(uj_job.job_type) && uj_job.job_type == merged {
                // Already-running job supersets the merged result; leave it.
                Ok((uj, None))
            } else {
                uj_job.job_type = merged;
                uj_job.state = JobState::Waiting;
                Ok((uj, None))
            }
        }
    }
}

fn merge_flags(a: JobFlags, b: JobFlags) -> JobFlags {
    JobFlags {
        override_: a.override_ || b.override_,
        irreversible: a.irreversible || b.irreversible,
        ignore_order: a.ignore_order || b.ignore_order,
        reloaded: a.reloaded || b.reloaded,
        sent_dbus_new: a.sent_dbus_new || b.sent_dbus_new,
    }
}

/// Whether a Waiting job can run now.
pub fn is_runnable(table: &JobTable, registry: &UnitRegistry, id: JobId) -> Result<bool, CoreError> {
    let job = table.get(id)?;
    if job.flags.ignore_order || job.job_type == JobType::Nop {
        return Ok(true);
    }
    let unit = registry.get(job.unit)?;

    if job.job_type.is_positive() {
        for &peer in unit.deps_of(Relation::After) {
            if registry.get(peer)?.has_installed_job() {
                return Ok(false);
            }
        }
    }
    for &peer in unit.deps_of(Relation::Before) {
        if let Some(peer_job_id) = registry.get(peer)?.job {
            let peer_type = table.get(peer_job_id)?.job_type;
            if matches!(peer_type, JobType::Stop | JobType::Restart) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// What `Run` asked the caller's event loop to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Dispatched; completion will arrive later through `Notify`/`finish`.
    Dispatched,
    /// Finished synchronously with this result.
    Finished(JobResult),
    /// Reported `EAGAIN`; job was put back on Waiting (caller should
    /// re-enqueue it once something changes).
    RetryLater,
}

/// `Run(j)`: moves `j` to Running and dispatches to the unit's state
/// machine, translating its `StartResult` into a `RunOutcome`.
pub async fn run(
    table: &mut JobTable,
    registry: &mut UnitRegistry,
    id: JobId,
) -> Result<RunOutcome, CoreError> {
    let unit_id = table.get(id)?.unit;
    if is_redundant(table.get(id)?.job_type, registry.get(unit_id)?.active_state) {
        table.get_mut(id)?.state = JobState::Running;
        return Ok(RunOutcome::Finished(JobResult::Done));
    }

    table.get_mut(id)?.state = JobState::Running;
    let job_type = table.get(id)?.job_type;
    let unit = registry.get_mut(unit_id)?;

    let result = match job_type {
        JobType::Start | JobType::VerifyActive => crate::unit::vtable::dispatch_start(unit).await?,
        JobType::Stop | JobType::Restart => crate::unit::vtable::dispatch_stop(unit).await?,
        JobType::Reload => crate::unit::vtable::dispatch_reload(unit).await?,
        JobType::Nop => StartResult::Already,
        JobType::RestartDependencies | JobType::TryRestart | JobType::ReloadOrStart | JobType::TryReload => {
            // These never reach `Run`: they are collapsed to a base type
            // before install.
            return Err(CoreError::UnmergeableJobTypes(job_type, job_type));
        }
    };

    Ok(match result {
        StartResult::OkQueued => RunOutcome::Dispatched,
        StartResult::Already => RunOutcome::Finished(JobResult::Done),
        StartResult::Refused => RunOutcome::Finished(JobResult::Skipped),
        StartResult::Invalid => RunOutcome::Finished(JobResult::Invalid),
        StartResult::AssertFailed => RunOutcome::Finished(JobResult::Assert),
        StartResult::Unsupported => RunOutcome::Finished(JobResult::Unsupported),
        StartResult::RetryLater => {
            table.get_mut(id)?.state = JobState::Waiting;
            RunOutcome::RetryLater
        }
        StartResult::Failed(_) => RunOutcome::Finished(JobResult::Failed),
    })
}

/// Effects of `finish` the caller's event loop must still carry out: jobs to
/// enqueue (restart-in-place rewrite, neighbor wakeups) and dependency jobs
/// to fail with `Dependency`.
#[derive(Debug, Default)]
pub struct FinishEffects {
    pub to_enqueue: Vec<JobId>,
    pub to_fail_dependency: Vec<JobId>,
    pub run_on_failure_triggers: bool,
}

/// `Finish(j, result, recursive, already)`.
pub fn finish(
    table: &mut JobTable,
    registry: &mut UnitRegistry,
    id: JobId,
    result: JobResult,
    recursive: bool,
    already: bool,
) -> Result<FinishEffects, CoreError> {
    let mut effects = FinishEffects::default();
    let job = table.get_mut(id)?;
    job.result = Some(result);

    if !already {
        tracing::info!(job_id = job.id.0, job_type = ?job.job_type, job_result = ?result, "job finished");
    }

    // Restart that completed its Stop half converts in place to Start
    // rather than uninstalling, so its job id (and any external observer's
    // handle to it) survives the transition.
    if result == JobResult::Done && job.job_type == JobType::Restart {
        job.job_type = JobType::Start;
        job.state = JobState::Waiting;
        effects.to_enqueue.push(id);
        return Ok(effects);
    }

    let unit_id = job.unit;
    let job_type = job.job_type;
    let overridden = job.flags.override_;

    if registry.get(unit_id)?.job == Some(id) {
        registry.get_mut(unit_id)?.job = None;
    } else if registry.get(unit_id)?.nop_job == Some(id) {
        registry.get_mut(unit_id)?.nop_job = None;
    }
    table.remove(id);

    if recursive && result != JobResult::Done {
        let unit = registry.get(unit_id)?;
        let mut dependent_relations: Vec<Relation> = match job_type {
            JobType::Start | JobType::VerifyActive => vec![Relation::RequiredBy, Relation::BoundBy],
            JobType::Stop => vec![Relation::ConflictedBy],
            _ => vec![],
        };
        // Overridable requirements only propagate a failure when the failing
        // job itself wasn't an override (matching `!j->override` in the
        // dependent-job fan-out).
        if matches!(job_type, JobType::Start | JobType::VerifyActive) && !overridden {
            dependent_relations.push(Relation::RequiredByOverridable);
        }
        for &rel in &dependent_relations {
            for &peer in unit.deps_of(rel) {
                if let Some(peer_job) = registry.get(peer)?.job {
                    let peer_type = table.get(peer_job)?.job_type;
                    if matches!(peer_type, JobType::Start | JobType::VerifyActive) {
                        effects.to_fail_dependency.push(peer_job);
                    }
                }
            }
        }
    }

    if matches!(result, JobResult::Timeout | JobResult::Dependency) {
        effects.run_on_failure_triggers = true;
    }

    let unit = registry.get(unit_id)?;
    for rel in [Relation::After, Relation::Before] {
        for &peer in unit.deps_of(rel) {
            if let Some(peer_job) = registry.get(peer)?.job {
                effects.to_enqueue.push(peer_job);
            }
        }
    }

    Ok(effects)
}
