//! The lazy/eager mutation API (spec §4.4.3): each verb edits the mirror,
//! amends the ledger, and — in eager mode — immediately calls `push`.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use rulesync_ledger::Ledger;
use rulesync_mirror::Mirror;
use rulesync_transport::TransportClient;
use rulesync_types::{RuleStatus, RulesetStatus};

use crate::reconciler;
use crate::{Reporter, with_ledger_guard};

const DEFAULT_COPY_POSTFIX: &str = " - COPY";

/// One handle per organization (spec §4.5). Stateless over the mirror and
/// ledger files on disk — two handles built from the same `(state_dir,
/// org_id)` observe the same filesystem and ledger by construction, so
/// there's no cache to keep coherent. See [`crate::handles::Handles`] for
/// the convenience constructor.
pub struct Facade {
    mirror: Mirror,
    ledger: Ledger,
    transport: TransportClient,
    org: String,
    eager: bool,
}

impl Facade {
    pub fn new(mirror: Mirror, ledger: Ledger, transport: TransportClient, org: impl Into<String>, eager: bool) -> Self {
        Self {
            mirror,
            ledger,
            transport,
            org: org.into(),
            eager,
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn refresh(&self, reporter: &mut dyn Reporter) -> Result<()> {
        with_ledger_guard(|| reconciler::refresh(&self.mirror, &self.ledger, &self.org, &self.transport, reporter))
    }

    pub fn push(&self, reporter: &mut dyn Reporter) -> Result<()> {
        with_ledger_guard(|| reconciler::push(&self.mirror, &self.ledger, &self.org, &self.transport, reporter))
    }

    fn maybe_push(&self, reporter: &mut dyn Reporter) -> Result<()> {
        if self.eager { self.push(reporter) } else { Ok(()) }
    }

    pub fn create_ruleset(&self, data: Value, reporter: &mut dyn Reporter) -> Result<String> {
        self.mirror.ensure_dir()?;
        let existing = self.mirror.list_rulesets()?;
        let id = self.mirror.mint_local_id(&existing);
        self.mirror.write_ruleset(&id, &data)?;
        with_ledger_guard(|| self.ledger.add_ruleset(&self.org, &id, RulesetStatus::True))?;
        self.maybe_push(reporter)?;
        Ok(id)
    }

    pub fn update_ruleset(&self, ruleset_id: &str, data: Value, reporter: &mut dyn Reporter) -> Result<()> {
        if self.mirror.locate_ruleset(ruleset_id)?.is_none() {
            bail!("ruleset {ruleset_id} is not known locally");
        }
        self.mirror.write_ruleset(ruleset_id, &data)?;
        with_ledger_guard(|| self.ledger.add_ruleset(&self.org, ruleset_id, RulesetStatus::True))?;
        self.maybe_push(reporter)
    }

    pub fn delete_ruleset(&self, ruleset_id: &str, reporter: &mut dyn Reporter) -> Result<()> {
        if self.mirror.locate_ruleset(ruleset_id)?.is_none() {
            bail!("ruleset {ruleset_id} is not known locally");
        }
        self.mirror.remove_ruleset(ruleset_id)?;
        with_ledger_guard(|| self.ledger.delete_ruleset(&self.org, ruleset_id, true))?;
        self.maybe_push(reporter)
    }

    pub fn create_rule(
        &self,
        ruleset_id: &str,
        rule: Value,
        tags: Option<Value>,
        reporter: &mut dyn Reporter,
    ) -> Result<String> {
        if self.mirror.locate_ruleset(ruleset_id)?.is_none() {
            bail!("ruleset {ruleset_id} is not known locally");
        }
        let existing = self.mirror.iter_rules(ruleset_id)?;
        let id = self.mirror.mint_local_id(&existing);
        let tags = tags.unwrap_or_else(|| Value::Object(Default::default()));
        self.mirror.write_rule(ruleset_id, &id, &rule, &tags)?;
        with_ledger_guard(|| self.ledger.add_rule(&self.org, ruleset_id, &id, RuleStatus::Both))?;
        self.maybe_push(reporter)?;
        Ok(id)
    }

    pub fn update_rule(&self, rule_id: &str, rule: Value, reporter: &mut dyn Reporter) -> Result<()> {
        let parent = self.require_rule_parent(rule_id)?;
        let tags = self.mirror.read_tags(&parent, rule_id)?;
        self.mirror.write_rule(&parent, rule_id, &rule, &tags)?;
        with_ledger_guard(|| self.ledger.add_rule(&self.org, &parent, rule_id, RuleStatus::Rule))?;
        self.maybe_push(reporter)
    }

    pub fn create_tags(&self, rule_id: &str, tags: Value, reporter: &mut dyn Reporter) -> Result<()> {
        let parent = self.require_rule_parent(rule_id)?;
        let rule = self.mirror.read_rule(&parent, rule_id)?;
        self.mirror.write_rule(&parent, rule_id, &rule, &tags)?;
        with_ledger_guard(|| self.ledger.add_rule(&self.org, &parent, rule_id, RuleStatus::Tags))?;
        self.maybe_push(reporter)
    }

    pub fn delete_rule(&self, rule_id: &str, reporter: &mut dyn Reporter) -> Result<()> {
        let parent = self.require_rule_parent(rule_id)?;
        self.mirror.remove_rule(&parent, rule_id)?;
        with_ledger_guard(|| self.ledger.delete_rule(&self.org, rule_id))?;
        self.maybe_push(reporter)
    }

    /// Intra-organization copy: read `x`'s rule+tags, create them under
    /// `dst_ruleset` with `postfix` appended to `name`.
    pub fn copy_rule(
        &self,
        rule_id: &str,
        dst_ruleset: &str,
        postfix: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> Result<String> {
        let parent = self.require_rule_parent(rule_id)?;
        let mut rule = self.mirror.read_rule(&parent, rule_id)?;
        let tags = self.mirror.read_tags(&parent, rule_id)?;
        apply_postfix(&mut rule, postfix);
        self.create_rule(dst_ruleset, rule, Some(tags), reporter)
    }

    /// Inter-organization copy: same as [`Self::copy_rule`] but the
    /// destination lives on `dst`'s facade, which may need to `refresh`
    /// first if its mirror directory doesn't exist yet.
    pub fn copy_rule_out(
        &self,
        rule_id: &str,
        dst: &Facade,
        dst_ruleset: &str,
        postfix: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> Result<String> {
        dst.materialize(reporter)?;
        let parent = self.require_rule_parent(rule_id)?;
        let mut rule = self.mirror.read_rule(&parent, rule_id)?;
        let tags = self.mirror.read_tags(&parent, rule_id)?;
        apply_postfix(&mut rule, postfix);
        dst.create_rule(dst_ruleset, rule, Some(tags), reporter)
    }

    /// Deep copy of a ruleset and every child rule/tags within this
    /// organization.
    pub fn copy_ruleset(&self, ruleset_id: &str, postfix: Option<&str>, reporter: &mut dyn Reporter) -> Result<String> {
        self.copy_ruleset_into(self, ruleset_id, postfix, reporter)
    }

    /// Deep copy of a ruleset onto `dst`'s organization.
    pub fn copy_ruleset_out(
        &self,
        ruleset_id: &str,
        dst: &Facade,
        postfix: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> Result<String> {
        dst.materialize(reporter)?;
        self.copy_ruleset_into(dst, ruleset_id, postfix, reporter)
    }

    fn copy_ruleset_into(
        &self,
        dst: &Facade,
        ruleset_id: &str,
        postfix: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> Result<String> {
        let mut ruleset = self.mirror.read_ruleset(ruleset_id)?;
        apply_postfix(&mut ruleset, postfix);
        let new_ruleset_id = dst.create_ruleset(ruleset, reporter)?;

        for rule_id in self.mirror.iter_rules(ruleset_id)? {
            let rule = self.mirror.read_rule(ruleset_id, &rule_id)?;
            let tags = self.mirror.read_tags(ruleset_id, &rule_id)?;
            dst.create_rule(&new_ruleset_id, rule, Some(tags), reporter)?;
        }
        Ok(new_ruleset_id)
    }

    /// Ensure this organization's mirror directory exists, triggering a
    /// `refresh` the first time a copy verb targets it.
    fn materialize(&self, reporter: &mut dyn Reporter) -> Result<()> {
        if !self.mirror.org_dir().exists() {
            self.refresh(reporter)?;
        }
        Ok(())
    }

    fn require_rule_parent(&self, rule_id: &str) -> Result<String> {
        self.mirror
            .locate_rule_parent(rule_id)?
            .with_context(|| format!("rule {rule_id} is not known locally"))
    }
}

fn apply_postfix(payload: &mut Value, postfix: Option<&str>) {
    let postfix = postfix.unwrap_or(DEFAULT_COPY_POSTFIX);
    if let Some(obj) = payload.as_object_mut()
        && let Some(name) = obj.get("name").and_then(Value::as_str)
    {
        let renamed = format!("{name}{postfix}");
        obj.insert("name".to_string(), Value::String(renamed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulesync_auth::Credentials;
    use serde_json::json;
    use tempfile::tempdir;

    struct NullReporter;
    impl Reporter for NullReporter {
        fn info(&mut self, _msg: &str) {}
        fn warn(&mut self, _msg: &str) {}
        fn error(&mut self, _msg: &str) {}
    }

    fn facade(state_dir: &std::path::Path, org: &str) -> Facade {
        let mirror = Mirror::new(state_dir.join(org));
        let ledger = Ledger::new(state_dir);
        let transport = TransportClient::new(
            "http://127.0.0.1:1",
            Credentials {
                user_id: "u".into(),
                api_key: "k".into(),
            },
            org,
        )
        .unwrap();
        Facade::new(mirror, ledger, transport, org, false)
    }

    #[test]
    fn create_ruleset_mints_local_id_and_records_ledger_entry() {
        let td = tempdir().unwrap();
        let facade = facade(td.path(), "org-1");
        let mut reporter = NullReporter;

        let id = facade
            .create_ruleset(json!({"name": "rs-A", "description": "", "ruleIds": []}), &mut reporter)
            .unwrap();

        assert!(id.ends_with("-localonly"));
        let doc = facade.ledger.load().unwrap();
        assert_eq!(doc.organizations["org-1"][&id].modified, RulesetStatus::True);
    }

    #[test]
    fn create_rule_requires_existing_ruleset() {
        let td = tempdir().unwrap();
        let facade = facade(td.path(), "org-1");
        let mut reporter = NullReporter;
        let err = facade
            .create_rule("nonexistent", json!({"name": "r"}), None, &mut reporter)
            .unwrap_err();
        assert!(err.to_string().contains("not known locally"));
    }

    #[test]
    fn delete_subsumption_removes_rule_from_ledger() {
        let td = tempdir().unwrap();
        let facade = facade(td.path(), "org-1");
        let mut reporter = NullReporter;

        let ruleset_id = facade
            .create_ruleset(json!({"name": "rs-A", "ruleIds": []}), &mut reporter)
            .unwrap();
        let rule_id = facade
            .create_rule(&ruleset_id, json!({"name": "r1"}), None, &mut reporter)
            .unwrap();
        facade.delete_rule(&rule_id, &mut reporter).unwrap();

        let doc = facade.ledger.load().unwrap();
        assert!(!doc.organizations["org-1"][&ruleset_id].rules.contains_key(&rule_id));
    }

    #[test]
    fn copy_rule_applies_default_postfix_to_name() {
        let td = tempdir().unwrap();
        let facade = facade(td.path(), "org-1");
        let mut reporter = NullReporter;

        let ruleset_id = facade
            .create_ruleset(json!({"name": "rs-A", "ruleIds": []}), &mut reporter)
            .unwrap();
        let rule_id = facade
            .create_rule(&ruleset_id, json!({"name": "r1"}), None, &mut reporter)
            .unwrap();
        let copy_id = facade.copy_rule(&rule_id, &ruleset_id, None, &mut reporter).unwrap();

        let copied = facade.mirror.read_rule(&ruleset_id, &copy_id).unwrap();
        assert_eq!(copied["name"], json!("r1 - COPY"));
    }

    #[test]
    fn copy_ruleset_deep_copies_children() {
        let td = tempdir().unwrap();
        let facade = facade(td.path(), "org-1");
        let mut reporter = NullReporter;

        let ruleset_id = facade
            .create_ruleset(json!({"name": "rs-A", "ruleIds": []}), &mut reporter)
            .unwrap();
        facade
            .create_rule(&ruleset_id, json!({"name": "r1"}), None, &mut reporter)
            .unwrap();
        facade
            .create_rule(&ruleset_id, json!({"name": "r2"}), None, &mut reporter)
            .unwrap();

        let new_ruleset = facade.copy_ruleset(&ruleset_id, None, &mut reporter).unwrap();
        assert_ne!(new_ruleset, ruleset_id);
        let copied_rule_ids = facade.mirror.iter_rules(&new_ruleset).unwrap();
        assert_eq!(copied_rule_ids.len(), 2);
        let names: std::collections::HashSet<_> = copied_rule_ids
            .iter()
            .map(|id| facade.mirror.read_rule(&new_ruleset, id).unwrap()["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["r1", "r2"].into_iter().map(String::from).collect());

        let copied_ruleset = facade.mirror.read_ruleset(&new_ruleset).unwrap();
        assert_eq!(copied_ruleset["name"], json!("rs-A - COPY"));
    }
}
