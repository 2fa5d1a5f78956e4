//! Application configuration
//!
//! Configuration is loaded once at startup from:
//! 1. Default values
//! 2. Config file (~/.config/snow/config.toml)
//! 3. Environment variables (SNOW_* prefix)
//!
//! Environment variables take precedence over config file values.
//! The loaded value is read-only for the rest of the session.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Environment variable prefix
const ENV_PREFIX: &str = "SNOW";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the embedded index and persisted local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log file (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Repository-relative folder holding media files
    #[serde(default = "default_media_folder")]
    pub media_folder: String,

    /// URL prefix under which media files are published
    #[serde(default = "default_public_folder")]
    pub public_folder: String,

    /// Whether the session should run the CMS action hooks
    #[serde(default)]
    pub custom_actions: bool,

    /// Configured content collections
    #[serde(default)]
    pub collections: Vec<Collection>,

    /// Backend selection and connection parameters
    #[serde(default)]
    pub backend: BackendConfig,
}

/// A named group of content files sharing a folder and file naming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub folder: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_slug")]
    pub slug: String,
}

impl Collection {
    pub fn new(name: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            folder: folder.into(),
            extension: default_extension(),
            slug: default_slug(),
        }
    }

    /// Folder with any leading/trailing slashes removed
    pub fn folder_path(&self) -> &str {
        self.folder.trim_matches('/')
    }
}

/// The `[backend]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Registered backend name (`local`, `github`, `example`, or custom)
    #[serde(default = "default_backend_name")]
    pub name: String,

    /// Repository in `owner/name` form
    #[serde(default)]
    pub repo: Option<String>,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// GitHub App name, used to derive the app slug
    #[serde(default)]
    pub app_name: Option<String>,

    /// OAuth client ID
    #[serde(default)]
    pub client_id: Option<String>,

    /// Root URL of the token-exchange service
    #[serde(default)]
    pub api_root: Option<String>,

    #[serde(default = "default_auth_endpoint")]
    pub auth_endpoint: String,

    /// Where the forge sends the user back after authorization
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Name of the local site directory (local backend)
    #[serde(default)]
    pub repo_folder: Option<String>,

    /// Network call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: default_backend_name(),
            repo: None,
            branch: default_branch(),
            app_name: None,
            client_id: None,
            api_root: None,
            auth_endpoint: default_auth_endpoint(),
            redirect_uri: default_redirect_uri(),
            repo_folder: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl BackendConfig {
    /// Split `repo` into `(owner, name)`
    pub fn repo_parts(&self) -> Result<(String, String), BackendError> {
        let repo = require(&self.repo, "backend.repo")?;
        match repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                Ok((owner.to_string(), name.to_string()))
            }
            _ => Err(BackendError::Configuration {
                key: "backend.repo".to_string(),
                details: format!("expected 'owner/name', got '{}'", repo),
            }),
        }
    }

    /// App slug: spaces replaced with hyphens, lower-cased
    pub fn app_slug(&self) -> Result<String, BackendError> {
        let name = require(&self.app_name, "backend.app_name")?;
        Ok(name.replace(' ', "-").to_lowercase())
    }
}

/// Return a required config value or a `Configuration` error naming the key
pub fn require<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, BackendError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BackendError::Configuration {
            key: key.to_string(),
            details: "missing required value".to_string(),
        }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_file: None,
            media_folder: default_media_folder(),
            public_folder: default_public_folder(),
            custom_actions: false,
            collections: Vec::new(),
            backend: BackendConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SNOW_DATA_DIR, SNOW_BACKEND, SNOW_BRANCH, SNOW_LOG_FILE)
    /// 2. Config file (~/.config/snow/config.toml or SNOW_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path from the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_BACKEND", ENV_PREFIX)) {
            if !val.is_empty() {
                self.backend.name = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_BRANCH", ENV_PREFIX)) {
            if !val.is_empty() {
                self.backend.branch = val;
            }
        }

        // Empty string clears it
        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SNOW_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("snow")
            .join("config.toml")
    }

    /// Find a collection by name
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Path of the embedded index for a local site folder.
    ///
    /// One store per folder name, suffixed so it never collides with
    /// unrelated databases in the same directory.
    pub fn index_path(&self, repo_folder: &str) -> PathBuf {
        self.data_dir.join(format!("{}-local.db", repo_folder))
    }

    /// Path of the persisted key/value state (OAuth state token, access token)
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("local_storage.json")
    }

    /// Public URL for a media file name
    pub fn public_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_folder.trim_end_matches('/'), file_name)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snow")
}

fn default_media_folder() -> String {
    "static/media".to_string()
}

fn default_public_folder() -> String {
    "/media".to_string()
}

fn default_extension() -> String {
    "md".to_string()
}

fn default_slug() -> String {
    "{{slug}}".to_string()
}

fn default_backend_name() -> String {
    "local".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_auth_endpoint() -> String {
    "/api/github/oauth/token".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:5173/".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}
