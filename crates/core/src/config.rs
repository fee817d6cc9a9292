//! Config file discovery and TOML loading.
//!
//! Settings resolve as CLI flag, then environment variable, then config file,
//! then built-in default. This module only covers the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;
use serde::de::DeserializeOwned;

use crate::APP_NAME;

/// Where a config file was found
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Explicit path provided via CLI or env var
    Explicit(PathBuf),
    /// Found in current working directory
    CurrentDir(PathBuf),
    /// Found in XDG config home (~/.config/aire-fetcher/)
    XdgConfig(PathBuf),
    /// Found in system config (/etc/aire-fetcher/)
    System(PathBuf),
    /// No config file found, using defaults
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ConfigSource::Explicit(p)
            | ConfigSource::CurrentDir(p)
            | ConfigSource::XdgConfig(p)
            | ConfigSource::System(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }

    /// Short label for log lines, e.g. "user config".
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigSource::Explicit(_) => "explicit",
            ConfigSource::CurrentDir(_) => "working directory",
            ConfigSource::XdgConfig(_) => "user config",
            ConfigSource::System(_) => "system config",
            ConfigSource::Defaults => "defaults",
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.path() {
            Some(p) => write!(f, "{} ({})", p.display(), self.kind()),
            None => write!(f, "(defaults)"),
        }
    }
}

/// Every location a config file may live in, highest precedence first.
///
/// `env_var` contributes an entry only when it is set. The user entry uses
/// `$XDG_CONFIG_HOME`, falling back to `~/.config`.
pub fn config_candidates(env_var: &str, filename: &str) -> Vec<ConfigSource> {
    let mut candidates = Vec::with_capacity(4);
    if let Some(path) = env::var_os(env_var).filter(|p| !p.is_empty()) {
        candidates.push(ConfigSource::Explicit(path.into()));
    }
    candidates.push(ConfigSource::CurrentDir(PathBuf::from(filename)));
    if let Some(dir) = user_config_dir() {
        candidates.push(ConfigSource::XdgConfig(dir.join(APP_NAME).join(filename)));
    }
    candidates.push(ConfigSource::System(
        Path::new("/etc").join(APP_NAME).join(filename),
    ));
    candidates
}

/// First existing file among [`config_candidates`], or `Defaults`.
pub fn find_config_file(env_var: &str, filename: &str) -> ConfigSource {
    for candidate in config_candidates(env_var, filename) {
        match candidate.path() {
            Some(path) if path.is_file() => return candidate,
            Some(path) => debug!("no {} config at {}", candidate.kind(), path.display()),
            None => {}
        }
    }
    ConfigSource::Defaults
}

fn user_config_dir() -> Option<PathBuf> {
    env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

/// Load and parse a TOML configuration file
///
/// Returns `T::default()` when the source is [`ConfigSource::Defaults`].
pub fn load_config<T: DeserializeOwned + Default>(source: &ConfigSource) -> anyhow::Result<T> {
    match source.path() {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: T = toml::from_str(&content)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            debug!("loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(T::default()),
    }
}
