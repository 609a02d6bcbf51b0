//! Controller configuration
//!
//! Loaded from a YAML file mounted into the pod (`/config/config.yaml`,
//! overridable via `CONTROLLER_CONFIG_PATH`). The listener image has no sane
//! built-in default, so the sentinel value fails validation until the chart
//! provides one.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";
const CONFIG_PATH_ENV: &str = "CONTROLLER_CONFIG_PATH";
const MISSING_IMAGE_CONFIG: &str = "MISSING_IMAGE_CONFIG";

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Listener child configuration
    pub listener: ListenerConfig,

    /// Remote registry client configuration
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Configuration stamped into every Listener the controller creates
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listener container image
    #[serde(default = "default_listener_image")]
    pub image: ImageConfig,
}

/// Image configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageConfig {
    /// Image repository (e.g., "ghcr.io/runners-platform/listener")
    pub repository: String,

    /// Image tag (e.g., "latest", "v0.3.1")
    pub tag: String,
}

impl ImageConfig {
    /// Returns `true` when both repository and tag are populated with real values.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let repo = self.repository.trim();
        let tag = self.tag.trim();

        !repo.is_empty()
            && repo != MISSING_IMAGE_CONFIG
            && !tag.is_empty()
            && tag != MISSING_IMAGE_CONFIG
    }

    /// Full image reference as consumed by the kubelet
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Remote registry client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Per-call timeout for registry requests, in seconds
    #[serde(default = "default_request_timeout", rename = "requestTimeoutSeconds")]
    pub request_timeout_seconds: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_listener_image() -> ImageConfig {
    ImageConfig {
        repository: MISSING_IMAGE_CONFIG.to_string(),
        tag: MISSING_IMAGE_CONFIG.to_string(),
    }
}

fn default_request_timeout() -> u64 {
    30
}

impl ControllerConfig {
    /// Load configuration from the mounted file, honoring the
    /// `CONTROLLER_CONFIG_PATH` override and falling back to defaults when
    /// the file is absent. Validation stays the caller's responsibility.
    #[must_use]
    pub fn load() -> Self {
        let override_path = std::env::var(CONFIG_PATH_ENV).ok();
        let config_path = override_path
            .as_deref()
            .filter(|path| Path::new(path).exists())
            .unwrap_or(DEFAULT_CONFIG_PATH);

        match Self::from_mounted_file(config_path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(
                    "Failed to load configuration from {}: {}. Using defaults.",
                    config_path, err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }

    /// Validate configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.listener.image.is_configured() {
            return Err(anyhow::anyhow!(
                "Listener image is not configured. Provide listener.image.repository and listener.image.tag."
            ));
        }

        if self.remote.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "remote.requestTimeoutSeconds must be greater than zero."
            ));
        }

        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig {
                image: default_listener_image(),
            },
            remote: RemoteConfig::default(),
        }
    }
}
