use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use serde_json::Value;

use rulesync_auth::Credentials;
use rulesync_config::{Config, LogLevel};
use rulesync_core::{Facade, Handles, Reporter};
use rulesync_ledger::Ledger;
use rulesync_types::RulesetStatus;

#[derive(Parser, Debug)]
#[command(name = "rulesync", version)]
#[command(about = "Terraform-style reconciler for a rule configuration platform")]
struct Cli {
    /// Explicit path to a .rulesync.toml file (default: look inside the state directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured state directory for this invocation.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the current workspace (organization id) for this invocation.
    #[arg(long)]
    workspace: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a ruleset from a POSTable JSON file.
    CreateRuleset { file: PathBuf },
    /// Replace a known ruleset's JSON with the contents of a file.
    UpdateRuleset { ruleset: String, file: PathBuf },
    /// Delete a ruleset and every rule under it.
    DeleteRuleset { ruleset: String },
    /// Create a rule under `ruleset` from a POSTable JSON file.
    CreateRule { ruleset: String, file: PathBuf },
    /// Replace a known rule's JSON with the contents of a file.
    UpdateRule { rule: String, file: PathBuf },
    /// Create or replace a rule's tags from a JSON file.
    CreateTags { rule: String, file: PathBuf },
    /// Delete a rule.
    DeleteRule { rule: String },
    /// Copy a rule into another ruleset in the same organization.
    CopyRule {
        rule: String,
        dst_ruleset: String,
        #[arg(long)]
        postfix: Option<String>,
    },
    /// Copy a rule into a ruleset in a different organization.
    CopyRuleOut {
        rule: String,
        dst_ruleset: String,
        dst_org: String,
        #[arg(long)]
        postfix: Option<String>,
    },
    /// Deep-copy a ruleset and its rules within the same organization.
    CopyRuleset {
        ruleset: String,
        #[arg(long)]
        postfix: Option<String>,
    },
    /// Deep-copy a ruleset and its rules into a different organization.
    CopyRulesetOut {
        ruleset: String,
        dst_org: String,
        #[arg(long)]
        postfix: Option<String>,
    },
    /// Replace the local mirror with the platform's current state, discarding pending edits.
    Refresh,
    /// Apply every pending ledger entry to the platform.
    Push,
    /// Pretty-print the state ledger.
    Plan,
    /// Render the current mirror as a ruleset/rule tree.
    List,
    /// Set the current workspace (organization id) and refresh it.
    Workspace { org_id: String },
    /// Print the rulesync version.
    Version,
}

struct CliReporter {
    level: LogLevel,
}

impl CliReporter {
    fn shows(&self, msg_level: LogLevel) -> bool {
        rank(msg_level) <= rank(self.level)
    }
}

fn rank(level: LogLevel) -> u8 {
    match level {
        LogLevel::Error => 0,
        LogLevel::Warn => 1,
        LogLevel::Info => 2,
        LogLevel::Debug => 3,
    }
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if self.shows(LogLevel::Info) {
            eprintln!("{} {msg}", style("[info]").cyan());
        }
    }

    fn warn(&mut self, msg: &str) {
        if self.shows(LogLevel::Warn) {
            eprintln!("{} {msg}", style("[warn]").yellow());
        }
    }

    fn error(&mut self, msg: &str) {
        if self.shows(LogLevel::Error) {
            eprintln!("{} {msg}", style("[error]").red().bold());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate().context("configuration is invalid")?;

    let state_dir = cli.state_dir.clone().unwrap_or_else(|| config.state_dir.clone());
    let ledger = Ledger::with_file(&state_dir, &config.state_file);
    let eager = !config.lazy_eval;
    let creds = Credentials {
        user_id: config.user_id.clone().expect("validated above"),
        api_key: config.api_key.clone().expect("validated above"),
    };
    let handles = Handles::new(&state_dir, &config.state_file, config.api_base_url.clone(), creds, eager);
    let mut reporter = CliReporter { level: config.log_level };

    match cli.cmd {
        Commands::Version => {
            println!("rulesync {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Commands::Workspace { org_id } => {
            ledger.set_workspace(&org_id)?;
            let facade = handles.get(&org_id)?;
            facade.refresh(&mut reporter)?;
            println!("workspace set to {org_id}");
            return Ok(());
        }
        Commands::Plan => {
            print_plan(&ledger)?;
            return Ok(());
        }
        _ => {}
    }

    let org_id = resolve_org(cli.workspace.as_deref(), &ledger)?;

    match cli.cmd {
        Commands::Version | Commands::Workspace { .. } | Commands::Plan => unreachable!(),
        Commands::Refresh => {
            handles.get(&org_id)?.refresh(&mut reporter)?;
        }
        Commands::Push => {
            handles.get(&org_id)?.push(&mut reporter)?;
        }
        Commands::List => {
            print_list(&handles.get(&org_id)?, &ledger, &org_id)?;
        }
        Commands::CreateRuleset { file } => {
            let data = read_json(&file)?;
            let id = handles.get(&org_id)?.create_ruleset(data, &mut reporter)?;
            println!("created ruleset {id}");
        }
        Commands::UpdateRuleset { ruleset, file } => {
            let data = read_json(&file)?;
            handles.get(&org_id)?.update_ruleset(&ruleset, data, &mut reporter)?;
            println!("updated ruleset {ruleset}");
        }
        Commands::DeleteRuleset { ruleset } => {
            handles.get(&org_id)?.delete_ruleset(&ruleset, &mut reporter)?;
            println!("deleted ruleset {ruleset}");
        }
        Commands::CreateRule { ruleset, file } => {
            let data = read_json(&file)?;
            let id = handles.get(&org_id)?.create_rule(&ruleset, data, None, &mut reporter)?;
            println!("created rule {id}");
        }
        Commands::UpdateRule { rule, file } => {
            let data = read_json(&file)?;
            handles.get(&org_id)?.update_rule(&rule, data, &mut reporter)?;
            println!("updated rule {rule}");
        }
        Commands::CreateTags { rule, file } => {
            let data = read_json(&file)?;
            handles.get(&org_id)?.create_tags(&rule, data, &mut reporter)?;
            println!("updated tags on {rule}");
        }
        Commands::DeleteRule { rule } => {
            handles.get(&org_id)?.delete_rule(&rule, &mut reporter)?;
            println!("deleted rule {rule}");
        }
        Commands::CopyRule { rule, dst_ruleset, postfix } => {
            let facade = handles.get(&org_id)?;
            let id = facade.copy_rule(&rule, &dst_ruleset, postfix.as_deref(), &mut reporter)?;
            println!("copied {rule} to {dst_ruleset}/{id}");
        }
        Commands::CopyRuleOut { rule, dst_ruleset, dst_org, postfix } => {
            let src = handles.get(&org_id)?;
            let dst = handles.get(&dst_org)?;
            let id = src.copy_rule_out(&rule, &dst, &dst_ruleset, postfix.as_deref(), &mut reporter)?;
            println!("copied {rule} to {dst_org}/{dst_ruleset}/{id}");
        }
        Commands::CopyRuleset { ruleset, postfix } => {
            let facade = handles.get(&org_id)?;
            let id = facade.copy_ruleset(&ruleset, postfix.as_deref(), &mut reporter)?;
            println!("copied ruleset {ruleset} to {id}");
        }
        Commands::CopyRulesetOut { ruleset, dst_org, postfix } => {
            let src = handles.get(&org_id)?;
            let dst = handles.get(&dst_org)?;
            let id = src.copy_ruleset_out(&ruleset, &dst, postfix.as_deref(), &mut reporter)?;
            println!("copied ruleset {ruleset} to {dst_org}/{id}");
        }
    }

    Ok(())
}

fn resolve_org(cli_workspace: Option<&str>, ledger: &Ledger) -> Result<String> {
    if let Some(org) = cli_workspace {
        return Ok(org.to_string());
    }
    let org = ledger.workspace()?;
    if org.is_empty() {
        bail!("no workspace set; run `rulesync workspace <org_id>` first or pass --workspace");
    }
    Ok(org)
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse JSON from {}", path.display()))
}

fn print_plan(ledger: &Ledger) -> Result<()> {
    let doc = ledger.load()?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn print_list(facade: &Facade, ledger: &Ledger, org_id: &str) -> Result<()> {
    let doc = ledger.load()?;
    let dirty = doc.organizations.get(org_id);

    for ruleset_id in facade.mirror().list_rulesets()? {
        let ruleset = facade.mirror().read_ruleset(&ruleset_id)?;
        let name = ruleset.get("name").and_then(Value::as_str).unwrap_or("?");
        let ruleset_dirty = dirty
            .and_then(|org| org.get(&ruleset_id))
            .is_some_and(|entry| entry.modified != RulesetStatus::False);
        println!("{name}{}", colored_id(&ruleset_id, ruleset_dirty));

        for rule_id in facade.mirror().iter_rules(&ruleset_id)? {
            let rule = facade.mirror().read_rule(&ruleset_id, &rule_id)?;
            let rname = rule.get("name").and_then(Value::as_str).unwrap_or("?");
            let rtype = rule.get("type").and_then(Value::as_str).unwrap_or("?");
            let rule_dirty = dirty
                .and_then(|org| org.get(&ruleset_id))
                .is_some_and(|entry| entry.rules.contains_key(&rule_id));
            println!("\t{rname} ({rtype}) {}", colored_id(&rule_id, rule_dirty));
        }
    }
    Ok(())
}

fn colored_id(id: &str, dirty: bool) -> String {
    let label = format!("({id})");
    if dirty {
        style(label).yellow().to_string()
    } else {
        style(label).blue().to_string()
    }
}
