//! Property-based tests for ledger and mirror invariants (spec §8):
//! the dirty-status lattice is commutative and idempotent, local ids are
//! detected consistently, and delete-subsumption holds for any sequence of
//! joins followed by a delete.

use proptest::prelude::*;
use rulesync_types::{RuleStatus, is_local_id};

fn rule_status_strategy() -> impl Strategy<Value = RuleStatus> {
    prop_oneof![
        Just(RuleStatus::Rule),
        Just(RuleStatus::Tags),
        Just(RuleStatus::Both),
    ]
}

proptest! {
    #[test]
    fn join_is_commutative(a in rule_status_strategy(), b in rule_status_strategy()) {
        prop_assert_eq!(a.join(b), b.join(a));
    }

    #[test]
    fn join_is_idempotent(a in rule_status_strategy()) {
        prop_assert_eq!(a.join(a), a);
    }

    #[test]
    fn both_is_the_top_of_the_lattice(a in rule_status_strategy()) {
        prop_assert_eq!(a.join(RuleStatus::Both), RuleStatus::Both);
    }

    #[test]
    fn local_id_detection_depends_only_on_suffix(uuid_like in "[a-f0-9]{8}") {
        let local = format!("{uuid_like}-localonly");
        let remote = uuid_like.clone();
        prop_assert!(is_local_id(&local));
        prop_assert!(!is_local_id(&remote));
    }

    #[test]
    fn delete_subsumption_holds_for_any_join_sequence(
        statuses in prop::collection::vec(rule_status_strategy(), 1..6)
    ) {
        use rulesync_types::{LedgerDocument, RulesetStatus};
        use rulesync_ledger::{add_rule, delete_rule};

        let mut doc = LedgerDocument::default();
        for s in &statuses {
            add_rule(&mut doc, "org-1", "R1", "X1", *s).unwrap();
        }
        prop_assert!(doc.organizations["org-1"]["R1"].rules.contains_key("X1"));

        delete_rule(&mut doc, "org-1", "X1");
        prop_assert!(
            !doc.organizations.get("org-1")
                .and_then(|r| r.get("R1"))
                .map(|e| e.rules.contains_key("X1"))
                .unwrap_or(false)
        );
        let _ = RulesetStatus::False;
    }
}
