//! The merge/collapse/redundancy tables underlying job installation.

use crate::job::JobType;
use crate::unit::ActiveState;

/// Lower-triangular merge table over the five mergeable base types. `None`
/// means the pair conflicts (the installer cancels the older job). Merging
/// is commutative (we only store one triangle) and, once collapsed,
/// associative and transitive-or-bust.
pub fn lookup_merge(a: JobType, b: JobType) -> Option<JobType> {
    use JobType::*;
    if a == b {
        return Some(a);
    }
    // Normalize so the match only needs one ordering.
    let (x, y) = (a, b);
    match (x, y) {
        (Start, VerifyActive) | (VerifyActive, Start) => Some(Start),
        (Start, Stop) | (Stop, Start) => None,
        (Start, Reload) | (Reload, Start) => Some(ReloadOrStart),
        (Start, Restart) | (Restart, Start) => Some(Restart),
        (VerifyActive, Stop) | (Stop, VerifyActive) => None,
        (VerifyActive, Reload) | (Reload, VerifyActive) => Some(Reload),
        (VerifyActive, Restart) | (Restart, VerifyActive) => Some(Restart),
        (Stop, Reload) | (Reload, Stop) => None,
        (Stop, Restart) | (Restart, Stop) => None,
        (Reload, Restart) | (Restart, Reload) => Some(Restart),
        _ => None,
    }
}

/// `job_type_collapse`: rewrites a transient type to a concrete one using
/// the unit's live active state.
pub fn collapse(t: JobType, active_state: ActiveState) -> JobType {
    match t {
        JobType::TryRestart => {
            if active_state.is_inactive_or_deactivating() {
                JobType::Nop
            } else {
                JobType::Restart
            }
        }
        JobType::ReloadOrStart => {
            if active_state.is_inactive_or_deactivating() {
                JobType::Start
            } else {
                JobType::Reload
            }
        }
        other => other,
    }
}

/// `job_type_merge_and_collapse`: merge then immediately collapse so the
/// installed type is always one of the five base types or `Nop`, never
/// `ReloadOrStart`/`TryRestart`.
pub fn merge_and_collapse(a: JobType, b: JobType, active_state: ActiveState) -> Option<JobType> {
    let merged = lookup_merge(a, b)?;
    Some(collapse(merged, active_state))
}

/// Whether merging `new` into an already-`Running` `installed` job can be
/// applied in place, or must instead patch-and-demote-to-Waiting. Every
/// mergeable base type is late-merge safe except Reload: letting a running
/// Reload absorb a second Reload would finish with the daemon still on its
/// stale pre-edit configuration.
pub fn is_late_merge_safe(installed: JobType) -> bool {
    !matches!(installed, JobType::Reload)
}

/// A Waiting job is redundant against a live state if the transition is
/// already achieved.
pub fn is_redundant(job_type: JobType, active_state: ActiveState) -> bool {
    use ActiveState::*;
    match job_type {
        JobType::Start => matches!(active_state, Active | Reloading),
        JobType::Stop => matches!(active_state, Inactive | Failed),
        JobType::VerifyActive => matches!(active_state, Active | Reloading),
        JobType::Reload => matches!(active_state, Reloading),
        JobType::Restart => matches!(active_state, Activating),
        JobType::Nop => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_commutative() {
        use JobType::*;
        let pairs = [
            (Start, VerifyActive),
            (Start, Stop),
            (Start, Reload),
            (Start, Restart),
            (VerifyActive, Stop),
            (VerifyActive, Reload),
            (VerifyActive, Restart),
            (Stop, Reload),
            (Stop, Restart),
            (Reload, Restart),
        ];
        for (a, b) in pairs {
            assert_eq!(lookup_merge(a, b), lookup_merge(b, a), "{a:?} merge {b:?} not commutative");
        }
    }

    #[test]
    fn stop_conflicts_with_everything_else() {
        use JobType::*;
        for other in [Start, VerifyActive, Reload, Restart] {
            assert_eq!(lookup_merge(Stop, other), None);
        }
    }

    #[test]
    fn start_and_reload_merge_to_reload_or_start_then_collapse() {
        assert_eq!(lookup_merge(JobType::Start, JobType::Reload), Some(JobType::ReloadOrStart));
        assert_eq!(collapse(JobType::ReloadOrStart, ActiveState::Inactive), JobType::Start);
        assert_eq!(collapse(JobType::ReloadOrStart, ActiveState::Active), JobType::Reload);
    }

    #[test]
    fn try_restart_collapses_to_nop_when_inactive() {
        assert_eq!(collapse(JobType::TryRestart, ActiveState::Inactive), JobType::Nop);
        assert_eq!(collapse(JobType::TryRestart, ActiveState::Deactivating), JobType::Nop);
        assert_eq!(collapse(JobType::TryRestart, ActiveState::Active), JobType::Restart);
    }

    #[test]
    fn only_reload_is_not_late_merge_safe() {
        use JobType::*;
        assert!(!is_late_merge_safe(Reload));
        for t in [Start, VerifyActive, Stop, Restart] {
            assert!(is_late_merge_safe(t));
        }
    }

    #[test]
    fn redundancy_matches_original_table() {
        use ActiveState::*;
        assert!(is_redundant(JobType::Start, Active));
        assert!(is_redundant(JobType::Start, Reloading));
        assert!(!is_redundant(JobType::Start, Inactive));
        assert!(is_redundant(JobType::Stop, Inactive));
        assert!(is_redundant(JobType::Stop, Failed));
        assert!(is_redundant(JobType::Reload, Reloading));
        assert!(!is_redundant(JobType::Reload, Active));
        assert!(is_redundant(JobType::Restart, Activating));
        assert!(is_redundant(JobType::Nop, Inactive));
    }

    /// Testable property #8: redundancy is monotone — recomputing it
    /// against an equivalent state gives the same answer (trivially true
    /// for a pure function of `(JobType, ActiveState)`, but worth pinning
    /// down since a future caching layer could violate it).
    #[test]
    fn redundancy_is_stable_across_repeated_queries() {
        for state in [Inactive, Activating, Active, Reloading, Deactivating, Failed] {
            for t in [
                JobType::Start,
                JobType::Stop,
                JobType::VerifyActive,
                JobType::Reload,
                JobType::Restart,
                JobType::Nop,
            ] {
                assert_eq!(is_redundant(t, state), is_redundant(t, state));
            }
        }
    }
}
