use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flags::EncodeOptions;

/// Process-wide settings. Built once at startup, then only read.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub calibre: CalibreConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibreConfig {
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    #[serde(default = "default_library")]
    pub library: PathBuf,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Seconds before a calibredb call is killed. Absent or 0 waits forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Variables copied from the server's environment into every child.
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
    /// Variables set explicitly on every child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for CalibreConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            library: default_library(),
            username: None,
            password: None,
            timeout_secs: None,
            pass_env: default_pass_env(),
            env: BTreeMap::new(),
        }
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("/opt/calibre/calibredb")
}
fn default_library() -> PathBuf {
    PathBuf::from("/library")
}
fn default_pass_env() -> Vec<String> {
    vec!["PATH".to_string(), "HOME".to_string(), "LANG".to_string()]
}

impl CalibreConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    /// The exact environment handed to calibredb: `pass_env` values that are
    /// set in `source`, overlaid with `env`.
    pub fn child_env<F>(&self, source: F) -> Vec<(String, String)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars: BTreeMap<String, String> = self
            .pass_env
            .iter()
            .filter_map(|name| source(name).map(|value| (name.clone(), value)))
            .collect();
        vars.extend(self.env.clone());
        vars.into_iter().collect()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct EncodingConfig {
    /// Send `series_index` 0.0 to calibredb instead of treating it as unset.
    #[serde(default)]
    pub emit_zero_series_index: bool,
}

impl EncodingConfig {
    pub fn options(&self) -> EncodeOptions {
        EncodeOptions {
            emit_zero_series_index: self.emit_zero_series_index,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "localhost:5000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Values from the command line or environment that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub executable: Option<PathBuf>,
    pub library: Option<PathBuf>,
    pub bind: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(executable) = overrides.executable {
            self.calibre.executable = executable;
        }
        if let Some(library) = overrides.library {
            self.calibre.library = library;
        }
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if overrides.username.is_some() {
            self.calibre.username = overrides.username;
        }
        if overrides.password.is_some() {
            self.calibre.password = overrides.password;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        self
    }
}

/// Read `path` if given, otherwise start from defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    Ok(config)
}
