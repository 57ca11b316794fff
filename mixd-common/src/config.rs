//! Configuration file and data directory resolution
//!
//! Resolution priority, highest first:
//! 1. Explicit path (command-line argument)
//! 2. Environment variable
//! 3. Platform config directory (`<config>/mixd/config.toml`)

use std::path::PathBuf;

use crate::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "MIXD_CONFIG";

/// Resolve the configuration file path, if any exists
pub fn resolve_config_file(cli_arg: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    let candidate = dirs::config_dir().map(|d| d.join("mixd").join("config.toml"))?;
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "Using platform config file");
        Some(candidate)
    } else {
        None
    }
}

/// Platform-default data directory for the database and stem cache
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mixd"))
        .unwrap_or_else(|| PathBuf::from("./mixd_data"))
}

/// Read and parse a TOML config file into the given type
pub fn load_toml<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arg_wins() {
        let resolved = resolve_config_file(Some("/tmp/custom.toml")).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn load_toml_reports_missing_file() {
        let err = load_toml::<toml::Value>(std::path::Path::new("/nonexistent/config.toml"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
