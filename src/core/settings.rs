//! App settings: gateway location, provider identity, and defaults.
//!
//! Settings live in a TOML file in the per-user config directory. The API
//! key itself never lands here; it stays in the [`crate::core::secrets`]
//! store under the provider name.

use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PROVIDER: &str = "OpenRouter";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write settings at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no home directory available")]
    NoProjectDirs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Provider name; doubles as the secret-store key for the API key.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub default_model: Option<String>,
    /// Optional identification headers sent to the gateway.
    pub http_referer: Option<String>,
    pub x_title: Option<String>,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            default_model: None,
            http_referer: None,
            x_title: None,
        }
    }
}

fn project_dirs() -> Result<ProjectDirs, SettingsError> {
    ProjectDirs::from("", "", "confab").ok_or(SettingsError::NoProjectDirs)
}

impl Settings {
    pub fn config_path() -> Result<PathBuf, SettingsError> {
        Ok(project_dirs()?.config_dir().join("settings.toml"))
    }

    /// Per-user data directory holding the conversation database and the
    /// MCP server definitions file.
    pub fn data_dir() -> Result<PathBuf, SettingsError> {
        Ok(project_dirs()?.data_dir().to_path_buf())
    }

    pub fn mcp_config_path() -> Result<PathBuf, SettingsError> {
        Ok(Self::data_dir()?.join("mcp-servers.json"))
    }

    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from_path(&Self::config_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomic save: write to a temp file in the same directory, then rename
    /// over the target.
    pub fn save_to_path(&self, path: &Path) -> Result<(), SettingsError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        let serialized = toml::to_string_pretty(self).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source: std::io::Error::other(source),
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|source| {
            SettingsError::Write {
                path: path.to_path_buf(),
                source,
            }
        })?;
        temp.write_all(serialized.as_bytes())
            .map_err(|source| SettingsError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        temp.persist(path).map_err(|err| SettingsError::Write {
            path: path.to_path_buf(),
            source: err.error,
        })?;
        Ok(())
    }
}
