//! Settings resolution: command-line flag, then environment, then `changekeeper.toml`,
//! then built-in defaults. Clap already folds the environment into the flag values, so
//! this module only has to layer the file underneath them.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "changekeeper.toml";
pub const DEFAULT_CHANGELOG: &str = "changelog.sql";

/// Contents of `changekeeper.toml`. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub url: Option<String>,
    pub changelog: Option<PathBuf>,
    pub credentials: Option<PathBuf>,
    pub labels: Option<String>,
    pub contexts: Option<String>,
    pub ledger_table: Option<String>,
    pub lock_table: Option<String>,
    /// Seconds to wait for the changelog lock.
    pub lock_wait: Option<u64>,
    /// Connect timeout in seconds.
    pub connect_timeout: Option<u64>,
}

impl FileConfig {
    /// Load a config file. A missing file is only an error when it was asked for explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {}", path.display(), e))?;
        Self::parse(&source)
            .map_err(|e| format!("invalid config file {}: {}", path.display(), e).into())
    }

    pub fn parse(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Overrides {
    pub url: Option<String>,
    pub changelog: Option<PathBuf>,
    pub credentials: Option<PathBuf>,
    pub labels: Option<String>,
    pub contexts: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub url: String,
    pub changelog: PathBuf,
    pub credentials: Option<PathBuf>,
    pub labels: Option<String>,
    pub contexts: Vec<String>,
    pub ledger_table: Option<String>,
    pub lock_table: Option<String>,
    pub lock_wait: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Settings {
    pub fn resolve(
        overrides: Overrides,
        file: FileConfig,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let url = overrides.url.or(file.url).ok_or(
            "no database URL given: pass --url, set CHANGEKEEPER_URL or add `url` to changekeeper.toml",
        )?;
        let contexts = overrides
            .contexts
            .or(file.contexts)
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            url,
            changelog: overrides
                .changelog
                .or(file.changelog)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHANGELOG)),
            credentials: overrides.credentials.or(file.credentials),
            labels: overrides.labels.or(file.labels).filter(|l| !l.trim().is_empty()),
            contexts,
            ledger_table: file.ledger_table,
            lock_table: file.lock_table,
            lock_wait: file.lock_wait.map(Duration::from_secs),
            connect_timeout: file.connect_timeout.map(Duration::from_secs),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
