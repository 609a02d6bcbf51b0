//! `Listener` Custom Resource Definition, the subscription process
//! configuration pointing job-demand signals at the current runner pool.

use super::autoscalingrunnerset::TlsConfig;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `Listener` CRD consumed by the listener controller to run one
/// demand-subscription process per runner set
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "runners.platform", version = "v1", kind = "Listener")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"RunnerSet","type":"string","jsonPath":".spec.ephemeralRunnerSetName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct ListenerSpec {
    /// Remote scale-set registry endpoint URL
    #[serde(rename = "configUrl")]
    pub config_url: String,

    /// Name of the Secret holding the registry access token
    #[serde(rename = "configSecret")]
    pub config_secret: String,

    /// Remote scale-set id to subscribe to
    #[serde(rename = "scaleSetId")]
    pub scale_set_id: i64,

    /// Name of the `EphemeralRunnerSet` this listener scales
    #[serde(rename = "ephemeralRunnerSetName")]
    pub ephemeral_runner_set_name: String,

    /// Resolved lower scaling bound
    #[serde(rename = "minRunners")]
    pub min_runners: i32,

    /// Resolved upper scaling bound
    #[serde(rename = "maxRunners")]
    pub max_runners: i32,

    /// Listener container image, supplied by controller configuration
    pub image: String,

    /// Custom TLS trust passed through from the owning runner set
    #[serde(default, rename = "serverTls", skip_serializing_if = "Option::is_none")]
    pub server_tls: Option<TlsConfig>,
}
