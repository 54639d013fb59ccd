//! Typed configuration loaded from a YAML document.
//!
//! This stands in for the tokenizer-plus-symbol-table the upstream tool
//! used to populate `LOGTYPE\DIR`, `LOGTYPE\PREFIX`, etc. The shape of the
//! data is the same; only the surface syntax changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::policy::Allowance;

/// Default process-wide allowance when no CIDR rule matches an address.
pub const DEFAULT_MAX_OFFENSES: u32 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_offenses")]
    pub max_offenses: u32,

    pub cache_dir: Option<PathBuf>,
    pub lock_path: Option<PathBuf>,

    #[serde(default)]
    pub log_types: Vec<LogTypeConfig>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Top-level keys this version of the config format doesn't recognize.
    /// Captured rather than rejected, like the original tool's tolerance
    /// for unknown symbols; reported to the administrator under `-v`.
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

fn default_max_offenses() -> u32 {
    DEFAULT_MAX_OFFENSES
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogTypeConfig {
    pub name: String,
    pub dir: PathBuf,
    pub prefix: String,
    #[serde(default)]
    pub regex: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub cidr: String,
    pub allowance: Allowance,
}

impl Config {
    /// Load and validate a config file from `path`.
    ///
    /// Validation here is limited to what `serde` and the top-level shape
    /// can catch; per-log-type validation (capture groups, regex compile)
    /// happens when the log type is actually constructed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for lt in &cfg.log_types {
            if lt.dir.as_os_str().is_empty() {
                return Err(ConfigError::MissingField {
                    log_type: lt.name.clone(),
                    field: "dir",
                });
            }
            if lt.prefix.is_empty() {
                return Err(ConfigError::MissingField {
                    log_type: lt.name.clone(),
                    field: "prefix",
                });
            }
        }
        for key in cfg.unused_keys() {
            debug!(path = %path.display(), key, "unused configuration key");
        }
        Ok(cfg)
    }

    /// Top-level keys present in the document but not recognized by this
    /// version of the config format, e.g. a typo or a removed option.
    pub fn unused_keys(&self) -> Vec<&str> {
        self.unknown.keys().map(String::as_str).collect()
    }
}
