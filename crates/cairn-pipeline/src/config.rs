//! Runtime configuration.
//!
//! Loaded from an optional TOML file, then overridden by `CAIRN_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cairn_types::{CairnError, Result};

pub const ENV_ROOT: &str = "CAIRN_ROOT";
pub const ENV_LOCK_TIMEOUT_SECS: &str = "CAIRN_LOCK_TIMEOUT_SECS";
pub const ENV_MAX_PARALLEL: &str = "CAIRN_MAX_PARALLEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding `<workspace>/<run>/...` trees.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Bound on waiting for the aggregate and status locks, in seconds.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Rules executed concurrently by the local executor.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".cairn/runs")
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_max_parallel() -> usize {
    4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            lock_timeout_secs: default_lock_timeout_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

impl RuntimeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CairnError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| CairnError::Config(format!("{}: {e}", path.display())))
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Apply `CAIRN_*` overrides read through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = lookup(ENV_ROOT) {
            self.root_dir = PathBuf::from(root);
        }
        if let Some(secs) = lookup(ENV_LOCK_TIMEOUT_SECS) {
            self.lock_timeout_secs = parse_env(ENV_LOCK_TIMEOUT_SECS, &secs)?;
        }
        if let Some(n) = lookup(ENV_MAX_PARALLEL) {
            self.max_parallel = parse_env(ENV_MAX_PARALLEL, &n)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(CairnError::Config("max_parallel must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| CairnError::Config(format!("{key}={raw:?} is not a valid number")))
}
