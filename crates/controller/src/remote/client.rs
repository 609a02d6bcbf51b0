//! Client trait and common types for the remote scale-set registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("registry rejected the credential (status {status})")]
    Auth { status: u16 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    /// Whether a retry against the same registry can succeed without a
    /// configuration change
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http(_) => true,
            RemoteError::Api { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Auth { .. }
            | RemoteError::NotFound(_)
            | RemoteError::InvalidConfig(_)
            | RemoteError::Serialization(_) => false,
        }
    }
}

/// A runner group as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerGroup {
    pub id: i64,
    pub name: String,
}

/// A scale set as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSet {
    pub id: i64,
    pub name: String,

    #[serde(rename = "runnerGroupId")]
    pub runner_group_id: i64,

    #[serde(rename = "runnerGroupName")]
    pub runner_group_name: String,
}

/// Creation request for a scale set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScaleSet {
    pub name: String,

    #[serde(rename = "runnerGroupId")]
    pub runner_group_id: i64,
}

/// Partial update applied to an existing scale set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSetUpdate {
    #[serde(rename = "runnerGroupId")]
    pub runner_group_id: i64,
}

/// Resolved material needed to construct a registry client. Secrets and
/// trust bundles are resolved to their content before this point so the
/// cache can key on what the credential *is*, not what it is named.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub endpoint: String,
    pub token: String,
    pub root_ca_pem: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Operations the controller needs from the scale-set registry.
///
/// Every call is idempotent from the caller's perspective: lookups report
/// absence instead of failing, and deleting an already-absent scale set
/// succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    /// Resolve a runner group by name; absent groups are a `NotFound` error
    async fn get_runner_group(&self, name: &str) -> Result<RunnerGroup, RemoteError>;

    /// Look up a scale set by group and name; absence is `None`, not an error
    async fn get_scale_set(
        &self,
        runner_group_id: i64,
        name: &str,
    ) -> Result<Option<ScaleSet>, RemoteError>;

    /// Register a new scale set
    async fn create_scale_set(&self, scale_set: &NewScaleSet) -> Result<ScaleSet, RemoteError>;

    /// Update an existing scale set; a `NotFound` result means the remote
    /// identity disappeared and must be re-derived
    async fn update_scale_set(
        &self,
        id: i64,
        update: &ScaleSetUpdate,
    ) -> Result<ScaleSet, RemoteError>;

    /// Delete a scale set; already-absent targets succeed
    async fn delete_scale_set(&self, id: i64) -> Result<(), RemoteError>;
}
