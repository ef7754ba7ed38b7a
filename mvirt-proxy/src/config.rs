//! Per-container proxy configuration.
//!
//! Each supervised container has one JSON document named after its identity
//! in the config directory (`/etc/mvirt-proxy/<id>.json` by default).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Label on the container record holding the scope it was deployed with.
pub const SCOPE_LABEL: &str = "io.mvirt.proxy/scope";

/// Scope that matches every other scope.
pub const ANY_SCOPE: &str = "*";

const DEFAULT_NAMESPACE: &str = "default";

/// Configuration for one supervised container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Container identity, taken from the file name rather than the document.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub namespace: String,
    pub image: String,
    /// Local image bundle to import when the image is not present.
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    /// Arguments placed between the program name and forwarded CLI args.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub inherit_cwd: bool,
    #[serde(default = "default_inherit_devices")]
    pub inherit_devices: bool,
}

fn default_inherit_devices() -> bool {
    true
}

impl ProxyConfig {
    /// Path of the configuration document for `id`.
    pub fn path(config_dir: &Path, id: &str) -> PathBuf {
        config_dir.join(format!("{id}.json"))
    }

    /// Load the configuration for `id` from `config_dir`.
    pub fn load(config_dir: &Path, id: &str) -> Result<Self, ConfigError> {
        let path = Self::path(config_dir, id);
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: ProxyConfig = serde_json::from_str(&content)
            .map_err(|source| ConfigError::Parse { path, source })?;
        config.with_id(id)
    }

    /// Parse a configuration document for `id`.
    pub fn from_json(id: &str, json: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(format!("<{id}>")),
            source,
        })?;
        config.with_id(id)
    }

    fn with_id(mut self, id: &str) -> Result<Self, ConfigError> {
        if id.is_empty() || id.contains('/') {
            return Err(ConfigError::Invalid(format!("invalid container id '{id}'")));
        }
        if self.image.is_empty() {
            return Err(ConfigError::Invalid(format!("no image configured for {id}")));
        }
        self.id = id.to_string();
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self
            .image_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.image_path = None;
        }
        Ok(self)
    }
}
