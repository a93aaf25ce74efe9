//! Configuration files for Nimbus
//!
//! Everything lives in one directory: `$NIMBUS_CONFIG_DIR` when set,
//! otherwise `nimbus/` under the platform config directory
//! (`~/.config/nimbus/` on Linux).
//!
//! Call [`init`] at application startup to bootstrap the config directory.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Name of the application directory inside the platform config directory
const APP_DIR: &str = "nimbus";

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "NIMBUS_CONFIG_DIR";

/// Create the config directory if needed and return its path.
/// Call this once at application startup.
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

pub fn config_dir() -> Option<PathBuf> {
    resolve_config_dir(std::env::var_os(CONFIG_DIR_ENV), dirs::config_dir())
}

fn resolve_config_dir(overridden: Option<OsString>, platform: Option<PathBuf>) -> Option<PathBuf> {
    match overridden.filter(|dir| !dir.is_empty()) {
        Some(dir) => Some(PathBuf::from(dir)),
        None => platform.map(|p| p.join(APP_DIR)),
    }
}

/// Path of a file inside the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Load a JSON file from the config directory, `None` if it is absent
pub fn load_optional_json<T: DeserializeOwned>(filename: &str) -> Result<Option<T>> {
    let Some(path) = config_path(filename) else {
        return Ok(None);
    };
    read_json(&path)
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    read_json(path)?.with_context(|| format!("Config file not found: {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file: {}", path.display()));
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        retries: u32,
    }

    #[test]
    fn test_platform_config_dir() {
        let dir = resolve_config_dir(None, Some(PathBuf::from("/home/u/.config")));
        assert_eq!(dir, Some(PathBuf::from("/home/u/.config/nimbus")));
        assert_eq!(resolve_config_dir(None, None), None);
    }

    #[test]
    fn test_config_dir_override() {
        let dir = resolve_config_dir(
            Some(OsString::from("/etc/nimbus-ci")),
            Some(PathBuf::from("/home/u/.config")),
        );
        assert_eq!(dir, Some(PathBuf::from("/etc/nimbus-ci")));

        // An empty override is ignored
        let dir = resolve_config_dir(Some(OsString::new()), Some(PathBuf::from("/cfg")));
        assert_eq!(dir, Some(PathBuf::from("/cfg/nimbus")));
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, r#"{ "name": "inbox", "retries": 5 }"#).unwrap();

        let sample: Sample = load_json_file(&path).unwrap();
        assert_eq!(sample.name, "inbox");
        assert_eq!(sample.retries, 5);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        assert!(read_json::<Sample>(&path).unwrap().is_none());
        let err = load_json_file::<Sample>(&path).unwrap_err();
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = read_json::<Sample>(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
