//! Configuration stored in `tablerun.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::gate::FlagColumns;
use crate::core::keys::{KeyFieldConfig, KeyFields};
use crate::error::ConfigError;

/// Top-level configuration (TOML).
///
/// Edited by humans and shared by every node. Missing sections fall back to
/// defaults, except `key_fields`, which must name at least one required field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub key_fields: BTreeMap<String, KeyFieldConfig>,
    pub fields: FieldNames,
    pub store: StoreConfig,
    pub agent: AgentConfig,
    pub runner: RunnerConfig,
    pub notify: NotifyConfig,
}

/// Column names of the flag fields every table carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldNames {
    pub ready: String,
    pub complete: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        let flags = FlagColumns::default();
        Self {
            ready: flags.ready,
            complete: flags.complete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one `<table>.json` per table.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tables"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Wait between writing a claim and re-reading it. Must comfortably
    /// exceed the store's write propagation delay.
    pub settle_secs: u64,

    /// Wall-clock budget for a `claim` work command.
    pub work_timeout_secs: u64,

    /// Truncate captured work command output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            settle_secs: 5,
            work_timeout_secs: 6 * 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Pause after each dispatched entry or goal. Defaults to 5 seconds.
    pub sleep_between_secs: Option<u64>,

    /// Directory of `<goal>_agent` executables. Defaults to `agents/` next to
    /// the running binary.
    pub goal_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Failure report recipients. Empty means reports go to the log.
    pub to: Vec<String>,
    pub from: Option<String>,
    /// Mail command reading a full message on stdin.
    pub command: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            to: Vec::new(),
            from: None,
            command: vec!["sendmail".to_string(), "-t".to_string()],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        KeyFields::new(&self.key_fields)?;
        if self.fields.ready.trim().is_empty() || self.fields.complete.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "fields.ready and fields.complete must be non-empty".to_string(),
            ));
        }
        if self.fields.ready == self.fields.complete {
            return Err(ConfigError::Invalid(
                "fields.ready and fields.complete must differ".to_string(),
            ));
        }
        if self.agent.work_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.work_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "agent.output_limit_bytes must be > 0".to_string(),
            ));
        }
        if !self.notify.to.is_empty()
            && (self.notify.command.is_empty() || self.notify.command[0].trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "notify.command must be a non-empty array when notify.to is set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn key_fields(&self) -> Result<KeyFields, ConfigError> {
        KeyFields::new(&self.key_fields)
    }

    pub fn flag_columns(&self) -> FlagColumns {
        FlagColumns {
            ready: self.fields.ready.clone(),
            complete: self.fields.complete.clone(),
        }
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_secs(self.agent.settle_secs)
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
