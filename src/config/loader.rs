//! Configuration loading
//!
//! Loading is read -> parse -> validate; any failure leaves the caller
//! with its previous configuration. When the config file is missing, a
//! commented default is materialised first so a fresh install starts
//! with a working file on disk.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// The embedded default configuration, written to disk on first start.
pub const DEFAULT_CONFIG: &str = include_str!("default.yml");

/// Load and validate a configuration file.
///
/// # Errors
///
/// `FileNotFound`, `ParseError`, or `ValidationError`.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading configuration");

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;

    info!(
        path = %path.display(),
        java_listeners = config.java.listeners.len(),
        java_servers = config.java.servers.len(),
        bedrock_listeners = config.bedrock.listeners.len(),
        bedrock_servers = config.bedrock.servers.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Parse and validate a configuration document from a string.
///
/// # Errors
///
/// `ParseError` or `ValidationError`.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Write the embedded default configuration to `path` unless a file is
/// already there.
///
/// # Errors
///
/// `SeedError` if the file or its parent directory cannot be written.
pub fn seed_default_config(path: impl AsRef<Path>) -> Result<bool, ConfigError> {
    let path = path.as_ref();
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::SeedError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }
    }
    std::fs::write(path, DEFAULT_CONFIG).map_err(|e| ConfigError::SeedError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    info!(path = %path.display(), "materialised default configuration");
    Ok(true)
}
