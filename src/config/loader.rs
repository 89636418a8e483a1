// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{RelayError, Result};

/// Environment variable naming the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "TRACERELAY_CONFIG";

/// Deserialize `path` into a [`RawConfigFile`] without semantic checks.
///
/// Read failures name the file, since the bare IO error does not.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        RelayError::ConfigError(format!("cannot read {}: {e}", path.display()))
    })?;
    let raw: RawConfigFile = toml::from_str(&contents)?;
    debug!(path = %path.display(), "config file parsed");
    Ok(raw)
}

/// Parse `path` and convert it into a validated [`ConfigFile`].
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    ConfigFile::try_from(load_from_path(path)?)
}

/// Like [`load_and_validate`], except that a missing file at the default
/// location means "all defaults". An explicitly named file must exist.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    if !path.exists() && path == default_config_path() {
        info!(path = %path.display(), "no config file found; using defaults");
        return ConfigFile::try_from(RawConfigFile::default());
    }
    load_and_validate(path)
}

/// `$TRACERELAY_CONFIG` if set and non-empty, else `Tracerelay.toml` in the
/// working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("Tracerelay.toml"))
}
