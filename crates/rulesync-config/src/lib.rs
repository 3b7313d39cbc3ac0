//! Configuration loading for rulesync.
//!
//! Three layers, lowest precedence first: built-in defaults, a
//! `.rulesync.toml` document, then `RULESYNC_`-prefixed environment
//! variables. [`Config::load`] resolves all three into a flat [`Config`]
//! and [`Config::validate`] turns missing credentials or a malformed file
//! into a `Configuration` [`ErrorKind`] before any engine is built.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use rulesync_types::ErrorKind;

pub const CONFIG_FILE: &str = ".rulesync.toml";
const DEFAULT_STATE_FILE: &str = ".threatstack.state.json";
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_API_BASE_URL: &str = "https://api.threatstack.com";
const ENV_PREFIX: &str = "RULESYNC_";

/// Verbosity for [`rulesync_core::Reporter`] implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => bail!("unrecognized LOGLEVEL '{other}' (expected error, warn, info, debug)"),
        }
    }
}

/// The on-disk `.rulesync.toml` shape. Every field is optional so a config
/// file can set as little or as much as it wants; missing fields fall
/// through to built-in defaults before environment overlays apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    state_file: Option<String>,
    lazy_eval: Option<bool>,
    log_level: Option<LogLevel>,
    user_id: Option<String>,
    api_key: Option<String>,
    max_retries: Option<u32>,
    api_base_url: Option<String>,
}

/// Fully resolved configuration: built-in defaults, overlaid by
/// `.rulesync.toml`, overlaid by `RULESYNC_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub state_file: String,
    pub lazy_eval: bool,
    pub log_level: LogLevel,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub api_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            state_file: DEFAULT_STATE_FILE.to_string(),
            lazy_eval: true,
            log_level: LogLevel::default(),
            user_id: None,
            api_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".threatstack")
}

impl Config {
    /// Load configuration, searching for `.rulesync.toml` at an explicit
    /// path if given, else inside the state directory implied by
    /// `RULESYNC_STATE_DIR` or the built-in default.
    pub fn load(explicit_config_path: Option<&Path>) -> Result<Config> {
        let mut config = Config::default();

        let search_dir = env::var(env_key("STATE_DIR"))
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);

        let config_path = explicit_config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| search_dir.join(CONFIG_FILE));

        if config_path.exists() {
            let file = ConfigFile::load_from_file(&config_path)?;
            file.apply_to(&mut config);
        } else if let Some(path) = explicit_config_path {
            bail!("config file not found: {}", path.display());
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Validate a resolved configuration before any engine is constructed.
    /// Missing credentials or (upstream, during `load`) an unparsable file
    /// are both `ErrorKind::Configuration` failures.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.as_deref().unwrap_or("").is_empty() {
            bail!("{:?}: missing USER_ID credential", ErrorKind::Configuration);
        }
        if self.api_key.as_deref().unwrap_or("").is_empty() {
            bail!("{:?}: missing API_KEY credential", ErrorKind::Configuration);
        }
        if self.state_file.is_empty() {
            bail!("{:?}: STATE_FILE must not be empty", ErrorKind::Configuration);
        }
        Ok(())
    }

    /// Path to the directory that holds the ledger and the per-organization
    /// mirrors.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var(env_key("STATE_DIR")) {
            self.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var(env_key("STATE_FILE")) {
            self.state_file = v;
        }
        if let Ok(v) = env::var(env_key("LAZY_EVAL")) {
            self.lazy_eval = parse_bool(&v)
                .with_context(|| format!("RULESYNC_LAZY_EVAL: invalid boolean '{v}'"))?;
        }
        if let Ok(v) = env::var(env_key("LOGLEVEL")) {
            self.log_level = v.parse()?;
        }
        if let Ok(v) = env::var(env_key("USER_ID")) {
            self.user_id = Some(v);
        }
        if let Ok(v) = env::var(env_key("API_KEY")) {
            self.api_key = Some(v);
        }
        if let Ok(v) = env::var(env_key("MAX_RETRIES")) {
            self.max_retries = v
                .parse()
                .with_context(|| format!("RULESYNC_MAX_RETRIES: invalid integer '{v}'"))?;
        }
        if let Ok(v) = env::var(env_key("API_BASE_URL")) {
            self.api_base_url = v;
        }
        Ok(())
    }
}

impl ConfigFile {
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("{:?}: failed to read config file {}", ErrorKind::Configuration, path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("{:?}: failed to parse config file {}", ErrorKind::Configuration, path.display()))
    }

    fn apply_to(self, config: &mut Config) {
        if let Some(v) = self.state_dir {
            config.state_dir = v;
        }
        if let Some(v) = self.state_file {
            config.state_file = v;
        }
        if let Some(v) = self.lazy_eval {
            config.lazy_eval = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.user_id {
            config.user_id = Some(v);
        }
        if let Some(v) = self.api_key {
            config.api_key = Some(v);
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.api_base_url {
            config.api_base_url = v;
        }
    }
}

fn env_key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
