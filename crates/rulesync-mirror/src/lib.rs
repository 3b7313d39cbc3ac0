//! On-disk mirror of one organization's rulesets, rules, and tags.
//!
//! Canonical layout: `<org_dir>/<ruleset_id>/ruleset.json` plus one
//! `<org_dir>/<ruleset_id>/<rule_id>/` per rule, holding `rule.json` and
//! `tags.json`. Writes are write-to-temp-then-rename so readers never
//! observe a partial file; no locking is required beyond the
//! single-writer assumption the reconciler enforces.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rulesync_types::LOCAL_SUFFIX;
use serde_json::Value;
use uuid::Uuid;

pub const RULESET_FILE: &str = "ruleset.json";
pub const RULE_FILE: &str = "rule.json";
pub const TAGS_FILE: &str = "tags.json";

/// A handle bound to one organization's directory under `<state_dir>`.
#[derive(Debug, Clone)]
pub struct Mirror {
    org_dir: PathBuf,
}

impl Mirror {
    pub fn new(org_dir: impl Into<PathBuf>) -> Self {
        Self {
            org_dir: org_dir.into(),
        }
    }

    pub fn org_dir(&self) -> &Path {
        &self.org_dir
    }

    /// Ensure the organization's directory exists on disk.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.org_dir)
            .with_context(|| format!("failed to create org dir {}", self.org_dir.display()))
    }

    /// Linear scan of ruleset directories for one containing `rule_id`.
    /// Returns the rule's directory if found.
    pub fn locate_rule(&self, rule_id: &str) -> Result<Option<PathBuf>> {
        for ruleset_id in self.list_rulesets()? {
            let candidate = self.ruleset_dir(&ruleset_id).join(rule_id);
            if candidate.is_dir() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Locate the ruleset directory containing `rule_id`, if any.
    pub fn locate_rule_parent(&self, rule_id: &str) -> Result<Option<String>> {
        for ruleset_id in self.list_rulesets()? {
            if self.ruleset_dir(&ruleset_id).join(rule_id).is_dir() {
                return Ok(Some(ruleset_id));
            }
        }
        Ok(None)
    }

    pub fn locate_ruleset(&self, ruleset_id: &str) -> Result<Option<PathBuf>> {
        let dir = self.ruleset_dir(ruleset_id);
        Ok(if dir.is_dir() { Some(dir) } else { None })
    }

    pub fn ruleset_dir(&self, ruleset_id: &str) -> PathBuf {
        self.org_dir.join(ruleset_id)
    }

    pub fn rule_dir(&self, ruleset_id: &str, rule_id: &str) -> PathBuf {
        self.ruleset_dir(ruleset_id).join(rule_id)
    }

    pub fn write_ruleset(&self, ruleset_id: &str, data: &Value) -> Result<()> {
        let dir = self.ruleset_dir(ruleset_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create ruleset dir {}", dir.display()))?;
        atomic_write_json(&dir.join(RULESET_FILE), data)
    }

    pub fn read_ruleset(&self, ruleset_id: &str) -> Result<Value> {
        read_json(&self.ruleset_dir(ruleset_id).join(RULESET_FILE))
    }

    pub fn write_rule(&self, ruleset_id: &str, rule_id: &str, rule: &Value, tags: &Value) -> Result<()> {
        let dir = self.rule_dir(ruleset_id, rule_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create rule dir {}", dir.display()))?;
        atomic_write_json(&dir.join(RULE_FILE), rule)?;
        atomic_write_json(&dir.join(TAGS_FILE), tags)
    }

    pub fn read_rule(&self, ruleset_id: &str, rule_id: &str) -> Result<Value> {
        read_json(&self.rule_dir(ruleset_id, rule_id).join(RULE_FILE))
    }

    pub fn read_tags(&self, ruleset_id: &str, rule_id: &str) -> Result<Value> {
        read_json(&self.rule_dir(ruleset_id, rule_id).join(TAGS_FILE))
    }

    pub fn remove_ruleset(&self, ruleset_id: &str) -> Result<()> {
        let dir = self.ruleset_dir(ruleset_id);
        if !dir.is_dir() {
            bail!("ruleset {ruleset_id} not found under {}", self.org_dir.display());
        }
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove ruleset dir {}", dir.display()))
    }

    pub fn remove_rule(&self, ruleset_id: &str, rule_id: &str) -> Result<()> {
        let dir = self.rule_dir(ruleset_id, rule_id);
        if !dir.is_dir() {
            bail!("rule {rule_id} not found under ruleset {ruleset_id}");
        }
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove rule dir {}", dir.display()))
    }

    /// Rename a ruleset directory after `push` assigns it a platform id.
    pub fn rename_ruleset(&self, old_id: &str, new_id: &str) -> Result<()> {
        fs::rename(self.ruleset_dir(old_id), self.ruleset_dir(new_id))
            .with_context(|| format!("failed to rename ruleset {old_id} to {new_id}"))
    }

    /// Rename a rule directory after `push` assigns it a platform id.
    pub fn rename_rule(&self, ruleset_id: &str, old_id: &str, new_id: &str) -> Result<()> {
        fs::rename(
            self.rule_dir(ruleset_id, old_id),
            self.rule_dir(ruleset_id, new_id),
        )
        .with_context(|| format!("failed to rename rule {old_id} to {new_id}"))
    }

    /// Every ruleset id under this organization, excluding the transient
    /// `.backup`/`.remote` staging directories.
    pub fn list_rulesets(&self) -> Result<Vec<String>> {
        if !self.org_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.org_dir)
            .with_context(|| format!("failed to read org dir {}", self.org_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ".backup" || name == ".remote" {
                continue;
            }
            out.push(name);
        }
        Ok(out)
    }

    /// Every rule id under `ruleset_id`.
    pub fn iter_rules(&self, ruleset_id: &str) -> Result<Vec<String>> {
        let dir = self.ruleset_dir(ruleset_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to read ruleset dir {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(out)
    }

    /// Mint a local-only identifier, retrying on collision against the
    /// directory listing `existing` comes from (rulesets under the
    /// organization, or rules under one ruleset).
    pub fn mint_local_id(&self, existing: &[String]) -> String {
        loop {
            let candidate = format!("{}{}", Uuid::new_v4(), LOCAL_SUFFIX);
            if !existing.iter().any(|id| id == &candidate) {
                return candidate;
            }
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse JSON from {}", path.display()))
}

/// Write-to-temp, rename, best-effort fsync of the parent directory — the
/// same durability technique the state ledger uses for its own document.
fn atomic_write_json(path: &Path, value: &Value) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        use std::io::Write;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!("failed to rename tmp file {} to {}", tmp.display(), path.display())
    })?;

    fsync_parent_dir(path);
    Ok(())
}

fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_ruleset_roundtrips() {
        let dir = tempdir().unwrap();
        let mirror = Mirror::new(dir.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        let data = json!({"name": "rs-A", "description": "", "ruleIds": []});
        mirror.write_ruleset("R1", &data).unwrap();
        assert_eq!(mirror.read_ruleset("R1").unwrap(), data);
    }

    #[test]
    fn locate_rule_scans_all_rulesets() {
        let dir = tempdir().unwrap();
        let mirror = Mirror::new(dir.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        mirror.write_ruleset("R1", &json!({})).unwrap();
        mirror
            .write_rule("R1", "X1", &json!({"name": "r"}), &json!({}))
            .unwrap();

        let parent = mirror.locate_rule_parent("X1").unwrap();
        assert_eq!(parent, Some("R1".to_string()));
        assert!(mirror.locate_rule("X1").unwrap().is_some());
        assert!(mirror.locate_rule("nonexistent").unwrap().is_none());
    }

    #[test]
    fn list_rulesets_excludes_staging_dirs() {
        let dir = tempdir().unwrap();
        let mirror = Mirror::new(dir.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        mirror.write_ruleset("R1", &json!({})).unwrap();
        fs::create_dir_all(mirror.org_dir().join(".backup")).unwrap();
        fs::create_dir_all(mirror.org_dir().join(".remote")).unwrap();

        let rulesets = mirror.list_rulesets().unwrap();
        assert_eq!(rulesets, vec!["R1".to_string()]);
    }

    #[test]
    fn mint_local_id_has_local_suffix_and_avoids_collisions() {
        let dir = tempdir().unwrap();
        let mirror = Mirror::new(dir.path().join("org-1"));
        let existing = vec!["abc-localonly".to_string()];
        let id = mirror.mint_local_id(&existing);
        assert!(id.ends_with(LOCAL_SUFFIX));
        assert_ne!(id, "abc-localonly");
    }

    #[test]
    fn remove_ruleset_errors_when_missing() {
        let dir = tempdir().unwrap();
        let mirror = Mirror::new(dir.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        assert!(mirror.remove_ruleset("nonexistent").is_err());
    }

    #[test]
    fn rename_ruleset_moves_directory() {
        let dir = tempdir().unwrap();
        let mirror = Mirror::new(dir.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        mirror.write_ruleset("U1-localonly", &json!({})).unwrap();
        mirror.rename_ruleset("U1-localonly", "R1").unwrap();
        assert!(mirror.locate_ruleset("R1").unwrap().is_some());
        assert!(mirror.locate_ruleset("U1-localonly").unwrap().is_none());
    }
}
