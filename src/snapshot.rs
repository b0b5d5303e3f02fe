//! The reexec snapshot format: a newline-delimited `key=value` stream per
//! job and per unit, with an empty line terminating each record. File
//! descriptors travel through a separate fd-set a key's value indexes
//! into, rather than inline in the text stream.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;

use crate::error::CoreError;
use crate::job::queue::JobTable;
use crate::job::{Job, JobFlags, JobId, JobState, JobType};
use crate::unit::automount::{AutomountLifecycle, AutomountResult, AutomountSnapshot};
use crate::unit::{ActiveState, Unit, UnitId, UnitKind, UnitRegistry};

/// File descriptors exported alongside the text snapshot, indexed by the
/// small integer a `pipe-fd`-style key's value names: file descriptors
/// transferred across a reexec travel through an explicit fd-set rather
/// than inline in the text.
#[derive(Debug, Default, Clone)]
pub struct FdSet {
    fds: Vec<RawFd>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, fd: RawFd) -> usize {
        self.fds.push(fd);
        self.fds.len() - 1
    }

    fn get(&self, index: usize) -> Option<RawFd> {
        self.fds.get(index).copied()
    }
}

/// Serializes every installed job and every non-stub unit into the
/// newline-delimited key=value stream.
pub fn serialize(registry: &UnitRegistry, jobs: &JobTable, job_ids: &[JobId]) -> Result<(String, FdSet), CoreError> {
    let mut out = String::new();
    let mut fdset = FdSet::new();

    for &id in job_ids {
        let job = jobs.get(id)?;
        write_job_record(&mut out, job);
    }

    for unit in registry.iter() {
        write_unit_record(&mut out, unit, &mut fdset);
    }

    Ok((out, fdset))
}

fn write_job_record(out: &mut String, job: &Job) {
    let _ = writeln!(out, "job-id={}", job.id.0);
    let _ = writeln!(out, "job-type={}", job_type_to_str(job.job_type));
    let _ = writeln!(out, "job-state={}", if job.state == JobState::Running { "running" } else { "waiting" });
    let _ = writeln!(out, "job-override={}", job.flags.override_);
    let _ = writeln!(out, "job-irreversible={}", job.flags.irreversible);
    let _ = writeln!(out, "job-sent-dbus-new-signal={}", job.flags.sent_dbus_new);
    let _ = writeln!(out, "job-ignore-order={}", job.flags.ignore_order);
    out.push('\n');
}

fn write_unit_record(out: &mut String, unit: &Unit, fdset: &mut FdSet) {
    let _ = writeln!(out, "unit-name={}", unit.canonical_name());
    let _ = writeln!(out, "state={}", active_state_to_str(unit.active_state));
    if let UnitKind::Automount(state) = &unit.kind {
        let snap = state.serialize();
        write_automount_record(out, &snap, fdset);
    }
    out.push('\n');
}

fn write_automount_record(out: &mut String, snap: &AutomountSnapshot, fdset: &mut FdSet) {
    if let Some(lifecycle) = snap.state {
        let _ = writeln!(out, "automount-state={}", lifecycle_to_str(lifecycle));
    }
    if let Some(result) = snap.result {
        let _ = writeln!(out, "automount-result={}", result_to_str(result));
    }
    if let Some(dev_id) = snap.dev_id {
        let _ = writeln!(out, "dev-id={dev_id}");
    }
    for &tok in &snap.tokens {
        let _ = writeln!(out, "token={tok}");
    }
    for &tok in &snap.expire_tokens {
        let _ = writeln!(out, "expire-token={tok}");
    }
    if let Some(fd) = snap.pipe_fd {
        let idx = fdset.push(fd);
        let _ = writeln!(out, "pipe-fd={idx}");
    }
}

/// One parsed record: the key=value pairs between two blank lines.
struct Record {
    fields: HashMap<String, Vec<String>>,
}

impl Record {
    fn get_one(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    fn get_many(&self, key: &str) -> &[String] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn parse_records(text: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current: HashMap<String, Vec<String>> = HashMap::new();
    for line in text.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                records.push(Record { fields: std::mem::take(&mut current) });
            }
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            current.entry(key.to_string()).or_default().push(value.to_string());
        }
    }
    if !current.is_empty() {
        records.push(Record { fields: current });
    }
    records
}

/// Restores unit active state, sub-state, and automount token/dev-id
/// bookkeeping from a previously-serialized snapshot. Units must already
/// be resolved into `registry` by name (coldplug happens
/// after the loader has re-populated stubs); this only restores state onto
/// units that already exist.
pub fn deserialize_into(
    registry: &mut UnitRegistry,
    text: &str,
    fdset: &FdSet,
) -> Result<(), CoreError> {
    for record in parse_records(text) {
        let Some(name) = record.get_one("unit-name") else { continue };
        let Some(unit_id) = registry.by_name(name) else { continue };
        restore_unit(registry, unit_id, &record, fdset)?;
    }
    Ok(())
}

fn restore_unit(registry: &mut UnitRegistry, unit_id: UnitId, record: &Record, fdset: &FdSet) -> Result<(), CoreError> {
    if let Some(state) = record.get_one("state") {
        let active = str_to_active_state(state);
        registry.get_mut(unit_id)?.active_state = active;
    }

    let has_automount_fields = record.get_one("automount-state").is_some();
    if has_automount_fields {
        let unit = registry.get_mut(unit_id)?;
        if let UnitKind::Automount(_) = &unit.kind {
            let name = unit.canonical_name().to_string();
            let snapshot = AutomountSnapshot {
                state: record.get_one("automount-state").map(str_to_lifecycle),
                result: record.get_one("automount-result").map(str_to_result),
                dev_id: record.get_one("dev-id").and_then(|v| v.parse().ok()),
                tokens: record.get_many("token").iter().filter_map(|v| v.parse().ok()).collect(),
                expire_tokens: record.get_many("expire-token").iter().filter_map(|v| v.parse().ok()).collect(),
                pipe_fd: record.get_one("pipe-fd").and_then(|v| v.parse::<usize>().ok()).and_then(|idx| fdset.get(idx)),
            };
            if let Ok(restored) = crate::unit::automount::AutomountState::coldplug(&name, snapshot) {
                unit.kind = UnitKind::Automount(restored);
            }
        }
    }
    Ok(())
}

fn job_type_to_str(t: JobType) -> &'static str {
    match t {
        JobType::Start => "start",
        JobType::VerifyActive => "verify-active",
        JobType::Stop => "stop",
        JobType::Reload => "reload",
        JobType::RestartDependencies => "restart-dependencies",
        JobType::Restart => "restart",
        JobType::TryRestart => "try-restart",
        JobType::ReloadOrStart => "reload-or-start",
        JobType::TryReload => "try-reload",
        JobType::Nop => "nop",
    }
}

fn active_state_to_str(s: ActiveState) -> &'static str {
    match s {
        ActiveState::Inactive => "inactive",
        ActiveState::Activating => "activating",
        ActiveState::Active => "active",
        ActiveState::Reloading => "reloading",
        ActiveState::Deactivating => "deactivating",
        ActiveState::Failed => "failed",
    }
}

fn str_to_active_state(s: &str) -> ActiveState {
    match s {
        "activating" => ActiveState::Activating,
        "active" => ActiveState::Active,
        "reloading" => ActiveState::Reloading,
        "deactivating" => ActiveState::Deactivating,
        "failed" => ActiveState::Failed,
        _ => ActiveState::Inactive,
    }
}

fn lifecycle_to_str(l: AutomountLifecycle) -> &'static str {
    match l {
        AutomountLifecycle::Dead => "dead",
        AutomountLifecycle::Waiting => "waiting",
        AutomountLifecycle::Running => "running",
        AutomountLifecycle::Failed => "failed",
    }
}

fn str_to_lifecycle(s: &str) -> AutomountLifecycle {
    match s {
        "waiting" => AutomountLifecycle::Waiting,
        "running" => AutomountLifecycle::Running,
        "failed" => AutomountLifecycle::Failed,
        _ => AutomountLifecycle::Dead,
    }
}

fn result_to_str(r: AutomountResult) -> &'static str {
    match r {
        AutomountResult::Success => "success",
        AutomountResult::FailureResources => "failure-resources",
    }
}

fn str_to_result(s: &str) -> AutomountResult {
    match s {
        "failure-resources" => AutomountResult::FailureResources,
        _ => AutomountResult::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn job_record_round_trips_through_the_text_format() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", || UnitKind::Service);
        let mut table = JobTable::new();
        let id = table.new_job(a, JobType::Start, Instant::now());
        table.get_mut(id).unwrap().flags = JobFlags { irreversible: true, ..Default::default() };

        let (text, _fdset) = serialize(&reg, &table, &[id]).unwrap();
        let records = parse_records(&text);
        let job_record = records.iter().find(|r| r.get_one("job-id").is_some()).unwrap();
        assert_eq!(job_record.get_one("job-type"), Some("start"));
        assert_eq!(job_record.get_one("job-irreversible"), Some("true"));
    }

    #[test]
    fn unit_active_state_round_trips() {
        let mut reg = UnitRegistry::new();
        let a = reg.resolve("a.service", || UnitKind::Service);
        reg.get_mut(a).unwrap().active_state = ActiveState::Active;
        let table = JobTable::new();

        let (text, fdset) = serialize(&reg, &table, &[]).unwrap();

        let mut fresh = UnitRegistry::new();
        fresh.resolve("a.service", || UnitKind::Service);
        deserialize_into(&mut fresh, &text, &fdset).unwrap();
        assert_eq!(fresh.get(fresh.by_name("a.service").unwrap()).unwrap().active_state, ActiveState::Active);
    }

    #[test]
    fn automount_tokens_and_dev_id_round_trip() {
        let mut reg = UnitRegistry::new();
        let state = crate::unit::automount::AutomountState::new("mnt-x.automount").unwrap();
        let a = reg.resolve("mnt-x.automount", || UnitKind::Automount(state));
        if let UnitKind::Automount(state) = &mut reg.get_mut(a).unwrap().kind {
            state.tokens.insert(7);
            state.dev_id = Some(42);
        }
        let table = JobTable::new();
        let (text, fdset) = serialize(&reg, &table, &[]).unwrap();

        let mut fresh = UnitRegistry::new();
        let state2 = crate::unit::automount::AutomountState::new("mnt-x.automount").unwrap();
        let b = fresh.resolve("mnt-x.automount", || UnitKind::Automount(state2));
        deserialize_into(&mut fresh, &text, &fdset).unwrap();
        if let UnitKind::Automount(restored) = &fresh.get(b).unwrap().kind {
            assert!(restored.tokens.contains(&7));
            assert_eq!(restored.dev_id, Some(42));
        } else {
            panic!("expected automount kind");
        }
    }
}
