//! A handful of worked scenarios exercised end to end through `Manager`
//! rather than unit-by-unit, to prove the pieces compose.

use std::time::Instant;

use unitcore::config::ManagerConfig;
use unitcore::job::{JobResult, JobType};
use unitcore::manager::Manager;
use unitcore::transaction::TransactionMode;
use unitcore::unit::automount::{AutofsPacket, AutomountState};
use unitcore::unit::{ActiveState, Relation, UnitKind};

fn manager() -> Manager {
    Manager::new(ManagerConfig::default())
}

/// S1: Start `a.service`, then Stop `a.service`. The Stop cancels the
/// Start before it ever ran.
#[tokio::test]
async fn s1_stop_cancels_an_uncompleted_start() {
    let mut m = manager();
    let a = m.resolve_unit("a.service", || UnitKind::Service);

    let start_job = m.add_job(a, JobType::Start, TransactionMode::Replace).unwrap();
    let stop_job = m.add_job(a, JobType::Stop, TransactionMode::Replace).unwrap();

    // The Stop replaced the Start outright: only one job remains installed.
    assert_ne!(start_job, stop_job);
    assert_eq!(m.registry.get(a).unwrap().job, Some(stop_job));
    assert!(m.jobs.get(start_job).is_err(), "cancelled Start should no longer be installed");
}

/// S2: Start `a.service` (let it reach Running), then Reload. The Reload
/// patches the installed job in place rather than installing a second one
/// (late-merge forbidden for Reload).
#[tokio::test]
async fn s2_reload_patches_running_start_in_place() {
    let mut m = manager();
    let a = m.resolve_unit("a.service", || UnitKind::Service);

    let start_job = m.add_job(a, JobType::Start, TransactionMode::Replace).unwrap();
    // Force the installed job into Running, active, to model "already
    // dispatched and the service came up" before the Reload arrives.
    m.jobs.get_mut(start_job).unwrap().state = unitcore::job::JobState::Running;
    m.registry.get_mut(a).unwrap().active_state = ActiveState::Active;

    let reload_job = m.add_job(a, JobType::Reload, TransactionMode::Replace).unwrap();
    assert_eq!(reload_job, start_job, "Reload should merge into the same installed job");
    let job = m.jobs.get(start_job).unwrap();
    assert_eq!(job.job_type, JobType::Reload);
    assert_eq!(job.state, unitcore::job::JobState::Waiting, "patched job is re-queued, not left Running");
}

/// S3: Restart `a.service` where `a` is active. After the Stop half
/// completes with Done, the same job rewrites in place to Start.
#[test]
fn s3_restart_done_converts_to_start_in_place() {
    let mut m = manager();
    let a = m.resolve_unit("a.service", || UnitKind::Service);
    m.registry.get_mut(a).unwrap().active_state = ActiveState::Active;

    let restart_job = m.jobs.new_job(a, JobType::Restart, Instant::now());
    m.registry.get_mut(a).unwrap().job = Some(restart_job);

    m.finish(restart_job, JobResult::Done, true, false).unwrap();

    let job = m.jobs.get(restart_job).unwrap();
    assert_eq!(job.job_type, JobType::Start);
    assert_eq!(m.registry.get(a).unwrap().job, Some(restart_job));
}

/// S4: `b.service` has `After=a.service`. Starting both leaves `b`'s Start
/// un-runnable until `a` has no installed job.
#[test]
fn s4_after_ordering_gates_runnability() {
    let mut m = manager();
    let a = m.resolve_unit("a.service", || UnitKind::Service);
    let b = m.resolve_unit("b.service", || UnitKind::Service);
    m.registry.add_dependency(b, Relation::After, a, true).unwrap();

    let a_job = m.add_job(a, JobType::Start, TransactionMode::Replace).unwrap();
    let b_job = m.add_job(b, JobType::Start, TransactionMode::Replace).unwrap();

    assert!(!unitcore::job::queue::is_runnable(&m.jobs, &m.registry, b_job).unwrap());

    // `a`'s job finishes and is uninstalled; `b`'s Start becomes runnable.
    m.finish(a_job, JobResult::Done, false, false).unwrap();
    assert!(unitcore::job::queue::is_runnable(&m.jobs, &m.registry, b_job).unwrap());
}

/// S5: an automount receives missing-direct for token 7, enters running,
/// and (once its sibling mount reports mounted) issues READY and arms the
/// expire timer.
#[test]
fn s5_automount_missing_direct_then_mount_coupling() {
    let mut state = AutomountState::new("mnt-x.automount").unwrap();
    assert_eq!(state.start().unwrap(), unitcore::unit::StartResult::OkQueued);

    let outcome = state.on_packet(
        AutofsPacket::MissingDirect { wait_queue_token: 7, dev: 1, ino: 2 },
        false,
    );
    assert_eq!(outcome, unitcore::unit::automount::AutomountIoOutcome::StartSiblingMount);
    assert_eq!(
        unitcore::unit::UnitImpl::active_state(&state),
        ActiveState::Active
    );

    let replies = state.update_mount(
        unitcore::unit::automount::MountPeerState::Mounting,
        unitcore::unit::automount::MountPeerState::Mounted,
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].token(), 7);
    assert_eq!(replies[0].status(), 0);
    assert!(state.expire_timer_armed);
}

/// S6: Isolate `rescue.target` queues Stop jobs for every active unit not
/// in its positive closure and not `ignore_on_isolate`.
#[test]
fn s6_isolate_stops_unrelated_active_units() {
    let mut m = manager();
    let rescue = m.resolve_unit("rescue.target", || UnitKind::Service);
    m.registry.get_mut(rescue).unwrap().policy.allow_isolate = true;

    let keep = m.resolve_unit("keep.service", || UnitKind::Service);
    m.registry.add_dependency(rescue, Relation::Requires, keep, true).unwrap();
    m.registry.get_mut(keep).unwrap().active_state = ActiveState::Active;

    let ignored = m.resolve_unit("ignored.service", || UnitKind::Service);
    m.registry.get_mut(ignored).unwrap().active_state = ActiveState::Active;
    m.registry.get_mut(ignored).unwrap().policy.ignore_on_isolate = true;

    let unrelated = m.resolve_unit("unrelated.service", || UnitKind::Service);
    m.registry.get_mut(unrelated).unwrap().active_state = ActiveState::Active;

    m.add_job(rescue, JobType::Start, TransactionMode::Isolate).unwrap();

    assert!(m.registry.get(unrelated).unwrap().job.is_some());
    assert_eq!(
        m.jobs.get(m.registry.get(unrelated).unwrap().job.unwrap()).unwrap().job_type,
        JobType::Stop
    );
    assert!(m.registry.get(keep).unwrap().job.is_none(), "positive closure member should not be stopped");
    assert!(m.registry.get(ignored).unwrap().job.is_none(), "ignore_on_isolate unit should not be stopped");
}
