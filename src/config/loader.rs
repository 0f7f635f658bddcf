use std::path::{Path, PathBuf};

use crate::config::types::PyrunConfig;
use crate::error::{PyrunError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "pyrun", "pyrun") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".pyrun").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested file must exist; the default location may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<PyrunConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(PyrunError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => get_config_path(),
    };

    if !path.exists() {
        // Return defaults if no config file exists
        return Ok(PyrunConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<PyrunConfig> {
    let config: PyrunConfig =
        toml::from_str(content).map_err(|e| PyrunError::TomlParse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
