//! Shared data types for rulesync: the state ledger's JSON schema, opaque
//! payload wrappers for rulesets/rules/tags, and the error-kind taxonomy
//! used to pick CLI exit codes and assert on error categories in tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Appended to any identifier minted locally before the platform has
/// assigned one. The sole marker that an id has never been seen remotely.
pub const LOCAL_SUFFIX: &str = "-localonly";

/// True if `id` was minted locally and has no remote counterpart yet.
pub fn is_local_id(id: &str) -> bool {
    id.ends_with(LOCAL_SUFFIX)
}

/// An opaque ruleset payload: at least `name`, `description`, `ruleIds`, but
/// pass-through beyond that — this crate never validates rule-payload shape.
pub type Ruleset = serde_json::Map<String, serde_json::Value>;

/// An opaque rule payload: at least `name`, `type`, `enabled`, `severity`.
pub type Rule = serde_json::Map<String, serde_json::Value>;

/// An opaque tags payload: `inclusion` and `exclusion` arrays.
pub type Tags = serde_json::Map<String, serde_json::Value>;

/// Which side of a rule is dirty relative to the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Rule,
    Tags,
    Both,
    Del,
}

impl RuleStatus {
    /// Join two statuses along the lattice `rule ∨ tags = both`,
    /// `rule ∨ rule = rule`, `both ∨ anything = both`. Callers never join
    /// against `Del` directly — `deleteRule` removes the entry outright
    /// instead of merging into it; the `Del` arms exist only so the type
    /// stays total.
    pub fn join(self, other: RuleStatus) -> RuleStatus {
        use RuleStatus::*;
        match (self, other) {
            (Del, x) | (x, Del) => x,
            (Both, _) | (_, Both) => Both,
            (Rule, Tags) | (Tags, Rule) => Both,
            (Rule, Rule) => Rule,
            (Tags, Tags) => Tags,
        }
    }
}

/// Whether a ruleset's own JSON was changed locally, is untouched but has
/// dirty children, or is pending deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesetStatus {
    True,
    False,
    Del,
}

/// One ruleset's pending mutations: its own modified flag plus per-rule
/// dirty status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetEntry {
    pub modified: RulesetStatus,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleStatus>,
}

impl Default for RulesetStatus {
    fn default() -> Self {
        RulesetStatus::False
    }
}

/// The whole ledger: which organizations have uncommitted local mutations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub organizations: BTreeMap<String, BTreeMap<String, RulesetEntry>>,
}

/// Classification of failures, used only so the CLI can choose an exit
/// code and tests can assert on error category without string-matching
/// messages. Not a parallel error-trait hierarchy — every fallible
/// function still returns `anyhow::Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    RateLimit,
    Invariant,
    NotFound,
    Cancelled,
}

/// Sink for progress and diagnostic output from the engine and transport,
/// implemented by front-ends (CLI, embedders). Not a parallel logging
/// framework — every fallible call still returns `anyhow::Result`; this is
/// purely where human-readable narration goes. Lives here rather than in
/// `rulesync-core` so `rulesync-transport` can report per-request without a
/// dependency cycle.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A [`Reporter`] that discards everything, for callers that don't care.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rule_and_tags_is_both() {
        assert_eq!(RuleStatus::Rule.join(RuleStatus::Tags), RuleStatus::Both);
        assert_eq!(RuleStatus::Tags.join(RuleStatus::Rule), RuleStatus::Both);
    }

    #[test]
    fn join_is_idempotent_for_equal_statuses() {
        assert_eq!(RuleStatus::Rule.join(RuleStatus::Rule), RuleStatus::Rule);
        assert_eq!(RuleStatus::Both.join(RuleStatus::Both), RuleStatus::Both);
    }

    #[test]
    fn join_both_absorbs_anything() {
        assert_eq!(RuleStatus::Both.join(RuleStatus::Tags), RuleStatus::Both);
        assert_eq!(RuleStatus::Rule.join(RuleStatus::Both), RuleStatus::Both);
    }

    #[test]
    fn local_id_detection() {
        assert!(is_local_id("abcd-1234-localonly"));
        assert!(!is_local_id("R1"));
    }

    #[test]
    fn ledger_roundtrips_through_json() {
        let mut doc = LedgerDocument {
            workspace: "org-1".to_string(),
            ..Default::default()
        };
        let mut entry = RulesetEntry {
            modified: RulesetStatus::False,
            rules: BTreeMap::new(),
        };
        entry.rules.insert("x1".to_string(), RuleStatus::Tags);
        doc.organizations
            .entry("org-1".to_string())
            .or_default()
            .insert("r1".to_string(), entry);

        let json = serde_json::to_string(&doc).unwrap();
        let back: LedgerDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workspace, "org-1");
        assert_eq!(
            back.organizations["org-1"]["r1"].rules["x1"],
            RuleStatus::Tags
        );
    }
}
