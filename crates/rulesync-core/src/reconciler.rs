//! `refresh` (remote -> local) and `push` (local -> remote), the two halves
//! of the reconciliation algorithm (spec §4.4.1, §4.4.2).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use rulesync_ledger::Ledger;
use rulesync_mirror::Mirror;
use rulesync_transport::TransportClient;
use rulesync_types::{RuleStatus, RulesetStatus, is_local_id};

use crate::Reporter;

const BACKUP_DIR: &str = ".backup";
const REMOTE_DIR: &str = ".remote";

/// Replace `org`'s local mirror atomically with the current remote view,
/// discarding any pending ledger entries for that organization.
pub fn refresh(
    mirror: &Mirror,
    ledger: &Ledger,
    org: &str,
    transport: &TransportClient,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let org_dir = mirror.org_dir();
    let backup_dir = org_dir.join(BACKUP_DIR);
    let remote_dir = org_dir.join(REMOTE_DIR);

    fs::create_dir_all(org_dir)
        .with_context(|| format!("failed to create org dir {}", org_dir.display()))?;

    recover_from_prior_crash(&backup_dir, &remote_dir, org_dir)?;

    fs::create_dir_all(&backup_dir).context("failed to create .backup staging dir")?;
    fs::create_dir_all(&remote_dir).context("failed to create .remote staging dir")?;
    for ruleset_id in mirror.list_rulesets()? {
        fs::rename(org_dir.join(&ruleset_id), backup_dir.join(&ruleset_id))
            .with_context(|| format!("failed to stage ruleset {ruleset_id} into .backup"))?;
    }

    match fetch_remote_into(&remote_dir, transport, reporter) {
        Ok(()) => {
            move_dir_contents(&remote_dir, org_dir)?;
            fs::remove_dir_all(&backup_dir).ok();
            fs::remove_dir_all(&remote_dir).ok();
            ledger.delete_organization(org)?;
            reporter.info(&format!("refresh({org}): mirror replaced, ledger entry cleared"));
            Ok(())
        }
        Err(err) => {
            reporter.warn(&format!("refresh({org}) failed, restoring prior mirror: {err}"));
            fs::remove_dir_all(&remote_dir).ok();
            move_dir_contents(&backup_dir, org_dir)?;
            fs::remove_dir_all(&backup_dir).ok();
            Err(err)
        }
    }
}

/// Step 2 of §4.4.1: `.remote` left over means an incomplete capture, throw
/// it away. `.backup` left over means a crash after staging but before (or
/// during) the fetch; restore it.
fn recover_from_prior_crash(backup_dir: &Path, remote_dir: &Path, org_dir: &Path) -> Result<()> {
    if remote_dir.is_dir() {
        fs::remove_dir_all(remote_dir).context("failed to discard incomplete .remote capture")?;
    }
    if backup_dir.is_dir() {
        move_dir_contents(backup_dir, org_dir)?;
        fs::remove_dir_all(backup_dir).context("failed to remove .backup after recovery")?;
    }
    Ok(())
}

fn fetch_remote_into(remote_dir: &Path, transport: &TransportClient, reporter: &mut dyn Reporter) -> Result<()> {
    let staging = Mirror::new(remote_dir.to_path_buf());
    let rulesets = transport.get_rulesets(reporter)?;
    let ruleset_ids = rulesets
        .get("rulesets")
        .and_then(Value::as_array)
        .context("getRulesets response missing 'rulesets' array")?;

    for entry in ruleset_ids {
        let ruleset_id = entry
            .get("id")
            .and_then(Value::as_str)
            .context("ruleset summary missing 'id'")?;
        reporter.info(&format!("refresh: fetching ruleset {ruleset_id}"));

        let ruleset = transport.get_ruleset(ruleset_id, reporter)?;
        staging.write_ruleset(ruleset_id, &ruleset)?;

        let rules = transport.get_ruleset_rules(ruleset_id, reporter)?;
        let rule_list = rules
            .get("rules")
            .and_then(Value::as_array)
            .context("getRulesetRules response missing 'rules' array")?;
        for rule in rule_list {
            let rule_id = rule
                .get("id")
                .and_then(Value::as_str)
                .context("rule summary missing 'id'")?;
            let full_rule = transport.get_rule(ruleset_id, rule_id, reporter)?;
            let tags = transport.get_rule_tags(rule_id, reporter)?;
            staging.write_rule(ruleset_id, rule_id, &full_rule, &tags)?;
        }
    }
    Ok(())
}

fn move_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .with_context(|| format!("failed to move {} to {}", entry.path().display(), target.display()))?;
    }
    Ok(())
}

/// Apply every pending ledger mutation for `org` to the remote platform, in
/// ledger order, persisting the ledger after each rule/ruleset completes so
/// a retry after a mid-push failure resumes from the first still-dirty
/// entry instead of repeating completed work.
pub fn push(
    mirror: &Mirror,
    ledger: &Ledger,
    org: &str,
    transport: &TransportClient,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    loop {
        let doc = ledger.load()?;
        let Some(org_entry) = doc.organizations.get(org) else {
            return Ok(());
        };
        let Some((ruleset_id, entry)) = org_entry.iter().next() else {
            ledger.delete_organization(org)?;
            return Ok(());
        };
        let ruleset_id = ruleset_id.clone();
        let modified = entry.modified;
        push_one_ruleset(mirror, ledger, org, &ruleset_id, modified, transport, reporter)?;
    }
}

fn push_one_ruleset(
    mirror: &Mirror,
    ledger: &Ledger,
    org: &str,
    ruleset_id: &str,
    modified: RulesetStatus,
    transport: &TransportClient,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    match modified {
        RulesetStatus::Del => {
            reporter.info(&format!("push: deleting ruleset {ruleset_id}"));
            transport.delete_ruleset(ruleset_id, reporter)?;
            forget_ruleset(ledger, org, ruleset_id)?;
            return Ok(());
        }
        RulesetStatus::True if is_local_id(ruleset_id) => {
            reporter.info(&format!("push: creating ruleset {ruleset_id}"));
            let data = Value::Object(mirror.read_ruleset(ruleset_id)?.as_object().cloned().unwrap_or_default());
            let created = transport.post_ruleset(&data, reporter)?;
            let new_id = response_id(&created)?;
            mirror.rename_ruleset(ruleset_id, &new_id)?;
            rename_ruleset_in_ledger(ledger, org, ruleset_id, &new_id)?;
            push_rules(mirror, ledger, org, &new_id, transport, reporter)?;
            forget_ruleset(ledger, org, &new_id)?;
        }
        RulesetStatus::True => {
            reporter.info(&format!("push: updating ruleset {ruleset_id}"));
            let data = mirror.read_ruleset(ruleset_id)?;
            transport.put_ruleset(ruleset_id, &data, reporter)?;
            push_rules(mirror, ledger, org, ruleset_id, transport, reporter)?;
            forget_ruleset(ledger, org, ruleset_id)?;
        }
        RulesetStatus::False => {
            push_rules(mirror, ledger, org, ruleset_id, transport, reporter)?;
            forget_ruleset(ledger, org, ruleset_id)?;
        }
    }
    Ok(())
}

fn push_rules(
    mirror: &Mirror,
    ledger: &Ledger,
    org: &str,
    ruleset_id: &str,
    transport: &TransportClient,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    loop {
        let doc = ledger.load()?;
        let Some(status) = doc
            .organizations
            .get(org)
            .and_then(|rulesets| rulesets.get(ruleset_id))
            .and_then(|entry| entry.rules.iter().next())
            .map(|(id, status)| (id.clone(), *status))
        else {
            return Ok(());
        };
        let (rule_id, rule_status) = status;
        push_one_rule(mirror, ledger, org, ruleset_id, &rule_id, rule_status, transport, reporter)?;
    }
}

fn push_one_rule(
    mirror: &Mirror,
    ledger: &Ledger,
    org: &str,
    ruleset_id: &str,
    rule_id: &str,
    status: RuleStatus,
    transport: &TransportClient,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    match status {
        RuleStatus::Del => {
            reporter.info(&format!("push: deleting rule {rule_id}"));
            transport.delete_rule(ruleset_id, rule_id, reporter)?;
            forget_rule(ledger, org, ruleset_id, rule_id)
        }
        RuleStatus::Rule => {
            let final_id = push_rule_body(mirror, transport, ruleset_id, rule_id, reporter)?;
            if final_id != rule_id {
                rename_rule_in_ledger(ledger, org, ruleset_id, rule_id, &final_id)?;
            }
            forget_rule(ledger, org, ruleset_id, &final_id)
        }
        RuleStatus::Tags => {
            if is_local_id(rule_id) {
                bail!("local-only rule {rule_id} cannot carry status 'tags' alone (I4)");
            }
            reporter.info(&format!("push: updating tags for rule {rule_id}"));
            let tags = mirror.read_tags(ruleset_id, rule_id)?;
            transport.post_tags(rule_id, &tags, reporter)?;
            forget_rule(ledger, org, ruleset_id, rule_id)
        }
        RuleStatus::Both => {
            let final_id = push_rule_body(mirror, transport, ruleset_id, rule_id, reporter)?;
            if final_id != rule_id {
                rename_rule_in_ledger(ledger, org, ruleset_id, rule_id, &final_id)?;
            }
            reporter.info(&format!("push: updating tags for rule {final_id}"));
            let tags = mirror.read_tags(ruleset_id, &final_id)?;
            transport.post_tags(&final_id, &tags, reporter)?;
            forget_rule(ledger, org, ruleset_id, &final_id)
        }
    }
}

/// Create (local-only) or update (remote-named) a rule's own body,
/// renaming its mirror directory on creation. Returns the id it now lives
/// under (unchanged for an update).
fn push_rule_body(
    mirror: &Mirror,
    transport: &TransportClient,
    ruleset_id: &str,
    rule_id: &str,
    reporter: &mut dyn Reporter,
) -> Result<String> {
    if is_local_id(rule_id) {
        let data = mirror.read_rule(ruleset_id, rule_id)?;
        let created = transport.post_rule(ruleset_id, &data, reporter)?;
        let new_id = response_id(&created)?;
        mirror.rename_rule(ruleset_id, rule_id, &new_id)?;
        Ok(new_id)
    } else {
        let data = mirror.read_rule(ruleset_id, rule_id)?;
        transport.put_rule(ruleset_id, rule_id, &data, reporter)?;
        Ok(rule_id.to_string())
    }
}

fn response_id(value: &Value) -> Result<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("platform response missing 'id'")
}

fn forget_ruleset(ledger: &Ledger, org: &str, ruleset_id: &str) -> Result<()> {
    ledger.with_document(|doc| {
        if let Some(org_entry) = doc.organizations.get_mut(org) {
            org_entry.remove(ruleset_id);
        }
        Ok(())
    })
}

fn forget_rule(ledger: &Ledger, org: &str, ruleset_id: &str, rule_id: &str) -> Result<()> {
    ledger.with_document(|doc| {
        if let Some(entry) = doc
            .organizations
            .get_mut(org)
            .and_then(|rulesets| rulesets.get_mut(ruleset_id))
        {
            entry.rules.remove(rule_id);
        }
        Ok(())
    })
}

fn rename_ruleset_in_ledger(ledger: &Ledger, org: &str, old_id: &str, new_id: &str) -> Result<()> {
    ledger.with_document(|doc| {
        if let Some(org_entry) = doc.organizations.get_mut(org)
            && let Some(entry) = org_entry.remove(old_id)
        {
            org_entry.insert(new_id.to_string(), entry);
        }
        Ok(())
    })
}

fn rename_rule_in_ledger(ledger: &Ledger, org: &str, ruleset_id: &str, old_id: &str, new_id: &str) -> Result<()> {
    ledger.with_document(|doc| {
        if let Some(entry) = doc
            .organizations
            .get_mut(org)
            .and_then(|rulesets| rulesets.get_mut(ruleset_id))
            && let Some(status) = entry.rules.remove(old_id)
        {
            entry.rules.insert(new_id.to_string(), status);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulesync_auth::Credentials;
    use serde_json::json;
    use std::thread;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    struct NullReporter;
    impl Reporter for NullReporter {
        fn info(&mut self, _msg: &str) {}
        fn warn(&mut self, _msg: &str) {}
        fn error(&mut self, _msg: &str) {}
    }

    fn start_test_server(rulesets: Value) -> (String, thread::JoinHandle<()>) {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            for req in server.incoming_requests() {
                let url = req.url().to_string();
                let body = if url == "/v2/rulesets" {
                    rulesets.to_string()
                } else if url.contains("/rules") && !url.contains("/tags") {
                    json!({"rules": []}).to_string()
                } else {
                    json!({"id": "R1", "name": "rs", "ruleIds": []}).to_string()
                };
                let _ = req.respond(Response::from_string(body));
            }
        });
        (addr, handle)
    }

    #[test]
    fn refresh_recovers_from_leftover_remote_staging_dir() {
        let td = tempdir().unwrap();
        let mirror = Mirror::new(td.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        fs::create_dir_all(mirror.org_dir().join(".remote")).unwrap();
        fs::write(mirror.org_dir().join(".remote").join("junk"), b"x").unwrap();

        let ledger = Ledger::new(td.path());
        let (base_url, _guard) = start_test_server(json!({"rulesets": []}));
        let creds = Credentials {
            user_id: "u".into(),
            api_key: "k".into(),
        };
        let transport = TransportClient::new(base_url, creds, "org-1").unwrap();
        let mut reporter = NullReporter;

        refresh(&mirror, &ledger, "org-1", &transport, &mut reporter).unwrap();
        assert!(!mirror.org_dir().join(".remote").exists());
        assert!(!mirror.org_dir().join(".backup").exists());
    }

    #[test]
    fn push_of_empty_ledger_is_a_noop() {
        let td = tempdir().unwrap();
        let mirror = Mirror::new(td.path().join("org-1"));
        mirror.ensure_dir().unwrap();
        let ledger = Ledger::new(td.path());
        let (base_url, _guard) = start_test_server(json!({"rulesets": []}));
        let creds = Credentials {
            user_id: "u".into(),
            api_key: "k".into(),
        };
        let transport = TransportClient::new(base_url, creds, "org-1").unwrap();
        let mut reporter = NullReporter;

        push(&mirror, &ledger, "org-1", &transport, &mut reporter).unwrap();
    }
}
