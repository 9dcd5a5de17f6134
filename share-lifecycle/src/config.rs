//! Configuration for the share lifecycle.
//!
//! Loaded from a JSON file; every field has a default so a partial file is
//! valid. Command-line flags override individual fields after loading.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};
use crate::models::Curve;

/// Protocol generation this build speaks to the remote engine
pub const SUPPORTED_PROTOCOL_VERSION: &str = "v6";

/// Behaviour switches that differ between protocol generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolCapabilities {
    /// Hold shares for every configured curve. When off only the first
    /// configured curve is used.
    pub multi_curve: bool,

    /// Mint, encrypt and rewrite a fresh backup share right after a
    /// successful recovery.
    pub refresh_backup_on_recover: bool,
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self {
            multi_curve: true,
            refresh_backup_on_recover: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    /// Client API key presented to the engine
    pub api_key: String,

    /// Engine host
    pub host: String,

    /// Hosted backend API host
    pub api_host: String,

    /// Protocol generation the client is configured for
    pub protocol_version: String,

    /// Curves to hold shares for
    pub curves: Vec<Curve>,

    pub capabilities: ProtocolCapabilities,

    /// Password for the password backend
    pub password: Option<String>,

    /// Free-form metadata forwarded with every engine call
    pub metadata: BTreeMap<String, String>,

    /// Directory for the local-file backend
    pub local_backup_dir: Option<PathBuf>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            host: "ws://127.0.0.1:9100".to_string(),
            api_host: "api.localhost".to_string(),
            protocol_version: SUPPORTED_PROTOCOL_VERSION.to_string(),
            curves: Curve::ALL.to_vec(),
            capabilities: ProtocolCapabilities::default(),
            password: None,
            metadata: BTreeMap::new(),
            local_backup_dir: None,
        }
    }
}

impl LifecycleConfig {
    /// Loads a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| LifecycleError::Config(format!("Failed to open {}: {}", path.display(), e)))?;
        let config: LifecycleConfig = serde_json::from_reader(file)
            .map_err(|e| LifecycleError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency. Protocol support is checked per
    /// operation, not here.
    pub fn validate(&self) -> Result<()> {
        if self.curves.is_empty() {
            return Err(LifecycleError::Config("at least one curve must be configured".to_string()));
        }
        let mut seen = self.curves.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.curves.len() {
            return Err(LifecycleError::Config("duplicate curve in configuration".to_string()));
        }
        Ok(())
    }

    /// Curves the orchestrator operates on under the current capabilities
    pub fn active_curves(&self) -> Vec<Curve> {
        if self.capabilities.multi_curve {
            self.curves.clone()
        } else {
            self.curves.iter().take(1).copied().collect()
        }
    }

    pub fn supports_protocol(&self) -> bool {
        self.protocol_version == SUPPORTED_PROTOCOL_VERSION
    }
}
