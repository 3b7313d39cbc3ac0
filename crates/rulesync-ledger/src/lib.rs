//! The state ledger: a JSON document recording the minimal set of pending
//! mutations for every organization with uncommitted local edits, plus the
//! mutators that keep it consistent with invariants I1-I6.
//!
//! The document is loaded, mutated in memory, and written back atomically by
//! every mutator here — there is no long-lived in-process cache, so two
//! ledger handles pointed at the same file always observe the same state
//! (the reconciler's job, not this crate's, is to serialize concurrent
//! access with a lock).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rulesync_types::{LedgerDocument, RuleStatus, RulesetEntry, RulesetStatus, is_local_id};

pub const LEDGER_FILE: &str = ".rulesync.state.json";

pub fn ledger_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LEDGER_FILE)
}

/// A handle to the ledger document on disk. Every mutating call here is a
/// full load-modify-store cycle; callers needing several mutations in one
/// atomic unit should use [`Ledger::with_document`].
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// A handle using the default ledger filename ([`LEDGER_FILE`]). Callers
    /// that need to honor a configurable `STATE_FILE` should use
    /// [`Ledger::with_file`] instead.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: ledger_path(state_dir),
        }
    }

    /// A handle using `file_name` instead of the default ledger filename —
    /// how `rulesync-config`'s `STATE_FILE` reaches the ledger.
    pub fn with_file(state_dir: &Path, file_name: &str) -> Self {
        Self {
            path: state_dir.join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<LedgerDocument> {
        if !self.path.exists() {
            return Ok(LedgerDocument::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read ledger {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse ledger JSON from {}", self.path.display()))
    }

    pub fn store(&self, doc: &LedgerDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger dir {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(doc).context("failed to serialize ledger")?;
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write ledger tmp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename ledger into place at {}", self.path.display()))
    }

    /// Load, apply `f`, and store back — the unit every mutator below builds
    /// on. `f` returning `Err` aborts the cycle; nothing is written.
    pub fn with_document<T>(&self, f: impl FnOnce(&mut LedgerDocument) -> Result<T>) -> Result<T> {
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.store(&doc)?;
        Ok(out)
    }

    /// The currently selected organization (empty if none has been set via
    /// [`Self::set_workspace`]).
    pub fn workspace(&self) -> Result<String> {
        Ok(self.load()?.workspace)
    }

    pub fn set_workspace(&self, org: &str) -> Result<()> {
        self.with_document(|doc| {
            doc.workspace = org.to_string();
            Ok(())
        })
    }

    pub fn add_organization(&self, org: &str) -> Result<()> {
        self.with_document(|doc| {
            add_organization(doc, org);
            Ok(())
        })
    }

    pub fn delete_organization(&self, org: &str) -> Result<()> {
        self.with_document(|doc| {
            delete_organization(doc, org);
            Ok(())
        })
    }

    pub fn add_ruleset(&self, org: &str, ruleset: &str, action: RulesetStatus) -> Result<()> {
        self.with_document(|doc| add_ruleset(doc, org, ruleset, action))
    }

    pub fn delete_ruleset(&self, org: &str, ruleset: &str, recursive: bool) -> Result<()> {
        self.with_document(|doc| delete_ruleset(doc, org, ruleset, recursive))
    }

    pub fn add_rule(&self, org: &str, ruleset: &str, rule: &str, endpoint: RuleStatus) -> Result<()> {
        self.with_document(|doc| add_rule(doc, org, ruleset, rule, endpoint))
    }

    pub fn delete_rule(&self, org: &str, rule: &str) -> Result<()> {
        self.with_document(|doc| {
            delete_rule(doc, org, rule);
            Ok(())
        })
    }
}

/// Create an empty organization entry if absent. Idempotent.
pub fn add_organization(doc: &mut LedgerDocument, org: &str) {
    doc.organizations.entry(org.to_string()).or_default();
}

/// Drop an organization's entire ledger entry. Used only by `push`
/// completion and `refresh` completion (I6: any dirty state is discarded by
/// `refresh` by design).
pub fn delete_organization(doc: &mut LedgerDocument, org: &str) {
    doc.organizations.remove(org);
}

/// `addRuleset(o, r, action)` — creation with invariant checks: upgrading
/// `false -> true` is allowed; `true -> false` is forbidden; adding
/// anything to a `del` entry is forbidden; creating a `false` ruleset
/// triggers no ledger write unless a rule follows (so a fresh `false` entry
/// is not inserted here — the first `add_rule` against it creates it).
pub fn add_ruleset(doc: &mut LedgerDocument, org: &str, ruleset: &str, action: RulesetStatus) -> Result<()> {
    let org_entry = doc.organizations.entry(org.to_string()).or_default();
    match org_entry.get_mut(ruleset) {
        None => match action {
            RulesetStatus::Del => bail!("cannot mark non-existent ruleset {ruleset} as deleted"),
            RulesetStatus::False => {}
            RulesetStatus::True => {
                org_entry.insert(
                    ruleset.to_string(),
                    RulesetEntry {
                        modified: RulesetStatus::True,
                        rules: Default::default(),
                    },
                );
            }
        },
        Some(entry) => {
            if entry.modified == RulesetStatus::Del {
                bail!("ruleset {ruleset} is pending deletion; no further edits allowed (I3)");
            }
            match (entry.modified, action) {
                (RulesetStatus::True, RulesetStatus::False) => {
                    bail!("ruleset {ruleset} cannot downgrade from 'true' to 'false'");
                }
                (_, RulesetStatus::Del) => {
                    bail!("use delete_ruleset to transition {ruleset} to 'del'");
                }
                (RulesetStatus::False, RulesetStatus::True) => entry.modified = RulesetStatus::True,
                _ => {}
            }
        }
    }
    Ok(())
}

/// `deleteRuleset(o, r, recursive)`. A local-only ruleset must carry
/// `modified == "true"` (I1) or this raises. Erases a local-only entry
/// outright (nothing remote to tell); transitions a remote-named entry to
/// `del` and clears its rules (I3).
pub fn delete_ruleset(doc: &mut LedgerDocument, org: &str, ruleset: &str, recursive: bool) -> Result<()> {
    let Some(org_entry) = doc.organizations.get_mut(org) else {
        return Ok(());
    };
    let Some(entry) = org_entry.get(ruleset) else {
        return Ok(());
    };

    if is_local_id(ruleset) {
        if entry.modified != RulesetStatus::True {
            bail!("local-only ruleset {ruleset} has modified={:?}, expected 'true' (I1)", entry.modified);
        }
        if entry.rules.is_empty() || recursive {
            org_entry.remove(ruleset);
        }
        return Ok(());
    }

    match entry.modified {
        RulesetStatus::Del => {}
        RulesetStatus::True | RulesetStatus::False => {
            if entry.rules.is_empty() {
                org_entry.remove(ruleset);
            } else if recursive {
                org_entry.insert(
                    ruleset.to_string(),
                    RulesetEntry {
                        modified: RulesetStatus::Del,
                        rules: Default::default(),
                    },
                );
            }
        }
    }
    Ok(())
}

/// `addRule(o, r, x, endpoint)` — joins `endpoint` into the existing status
/// for rule `x` along the lattice (`rule ∨ tags = both`), creating the
/// ruleset entry (as `false`) and the organization entry if either is
/// absent. A local-only rule may only carry `rule` or `both` (I4); `tags`
/// alone on a never-pushed rule is meaningless since there's no remote rule
/// to attach tags to yet.
pub fn add_rule(doc: &mut LedgerDocument, org: &str, ruleset: &str, rule: &str, endpoint: RuleStatus) -> Result<()> {
    if matches!(endpoint, RuleStatus::Del) {
        bail!("add_rule cannot set status 'del'; use delete_rule");
    }
    if is_local_id(rule) && matches!(endpoint, RuleStatus::Tags) {
        bail!("local-only rule {rule} cannot carry status 'tags' alone (I4)");
    }

    let org_entry = doc.organizations.entry(org.to_string()).or_default();
    let ruleset_entry = org_entry.entry(ruleset.to_string()).or_insert_with(|| RulesetEntry {
        modified: RulesetStatus::False,
        rules: Default::default(),
    });
    if ruleset_entry.modified == RulesetStatus::Del {
        bail!("cannot add rule {rule} to ruleset {ruleset} pending deletion (I3)");
    }

    let prior = ruleset_entry.rules.get(rule).copied();
    let joined = match prior {
        Some(p) => p.join(endpoint),
        None => endpoint,
    };
    ruleset_entry.rules.insert(rule.to_string(), joined);
    Ok(())
}

/// `deleteRule(o, x)` — removes the rule from whatever ruleset contains it.
/// If that leaves the ruleset entry with zero rules and `modified ==
/// "false"`, the ruleset entry is dropped too (I2: an untouched ruleset
/// entry only exists to carry dirty rules).
pub fn delete_rule(doc: &mut LedgerDocument, org: &str, rule: &str) {
    let Some(org_entry) = doc.organizations.get_mut(org) else {
        return;
    };
    let mut emptied_untouched = None;
    for (ruleset_id, entry) in org_entry.iter_mut() {
        if entry.rules.remove(rule).is_some() {
            if entry.rules.is_empty() && entry.modified == RulesetStatus::False {
                emptied_untouched = Some(ruleset_id.clone());
            }
            break;
        }
    }
    if let Some(ruleset_id) = emptied_untouched {
        org_entry.remove(&ruleset_id);
    }
}
