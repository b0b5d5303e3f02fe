//! The twenty-plus typed dependency relations and their symmetric partners,
//! each carrying its own reverse-partner rule so the registry can maintain
//! the symmetry invariant in one place.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    Requires,
    RequiresOverridable,
    Requisite,
    RequisiteOverridable,
    Wants,
    BindsTo,
    PartOf,
    Conflicts,
    ConflictedBy,
    Before,
    After,
    OnFailure,
    Triggers,
    TriggeredBy,
    PropagatesReloadTo,
    ReloadPropagatedFrom,
    RequiredBy,
    RequiredByOverridable,
    WantedBy,
    BoundBy,
    ConsistsOf,
    JoinsNamespaceOf,
}

impl Relation {
    /// The relation that must hold `R⁻¹(b, a)` whenever `R(a, b)` holds.
    pub fn partner(self) -> Relation {
        use Relation::*;
        match self {
            Requires => RequiredBy,
            RequiredBy => Requires,
            RequiresOverridable => RequiredByOverridable,
            RequiredByOverridable => RequiresOverridable,
            Requisite => RequiredBy,
            RequisiteOverridable => RequiredByOverridable,
            Wants => WantedBy,
            WantedBy => Wants,
            BindsTo => BoundBy,
            BoundBy => BindsTo,
            PartOf => ConsistsOf,
            ConsistsOf => PartOf,
            Conflicts => ConflictedBy,
            ConflictedBy => Conflicts,
            Before => After,
            After => Before,
            OnFailure => OnFailure,
            Triggers => TriggeredBy,
            TriggeredBy => Triggers,
            PropagatesReloadTo => ReloadPropagatedFrom,
            ReloadPropagatedFrom => PropagatesReloadTo,
            JoinsNamespaceOf => JoinsNamespaceOf,
        }
    }

    /// Requirement-family edges pull additional units into a transaction
    /// and are the ones that set `JobDependency::matters`.
    pub fn matters_for_transaction(self) -> bool {
        matches!(
            self,
            Relation::Requires
                | Relation::RequiresOverridable
                | Relation::Requisite
                | Relation::RequisiteOverridable
                | Relation::BindsTo
        )
    }

    /// Negative edges that cause a Stop to be queued on the peer rather
    /// than a Start.
    pub fn is_conflict(self) -> bool {
        matches!(self, Relation::Conflicts | Relation::ConflictedBy)
    }

    /// Ordering-only edges: used by the scheduler's runnability check,
    /// never by transaction inclusion.
    pub fn is_ordering(self) -> bool {
        matches!(self, Relation::Before | Relation::After)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Most relations form a true bijective pair: adding R(a,b) reciprocally
    /// adds R⁻¹(b,a), and R⁻¹'s own partner is R again. `Requisite(By)` is
    /// the one deliberate exception (see below): both `Requires` and
    /// `Requisite` feed the same `RequiredBy` reverse relation.
    #[test]
    fn partner_is_involutive_for_proper_pairs() {
        use Relation::*;
        let all = [
            Requires,
            RequiresOverridable,
            Wants,
            BindsTo,
            PartOf,
            Conflicts,
            ConflictedBy,
            Before,
            After,
            OnFailure,
            Triggers,
            TriggeredBy,
            PropagatesReloadTo,
            ReloadPropagatedFrom,
            RequiredBy,
            RequiredByOverridable,
            WantedBy,
            BoundBy,
            ConsistsOf,
            JoinsNamespaceOf,
        ];
        for r in all {
            assert_eq!(r.partner().partner(), r, "partner not involutive for {r:?}");
        }
    }

    #[test]
    fn requisite_feeds_required_by_like_requires_does() {
        // Deliberate asymmetry: Requisite(a,b) adds RequiredBy(b,a), same as
        // Requires does, because the relation list has no distinct
        // "RequisiteBy". RequiredBy's own partner resolves back to Requires.
        assert_eq!(Relation::Requisite.partner(), Relation::RequiredBy);
        assert_eq!(Relation::RequiredBy.partner(), Relation::Requires);
    }

    #[test]
    fn matters_for_transaction_covers_requires_family() {
        assert!(Relation::Requires.matters_for_transaction());
        assert!(Relation::BindsTo.matters_for_transaction());
        assert!(!Relation::Wants.matters_for_transaction());
        assert!(!Relation::Before.matters_for_transaction());
    }
}
