//! `EphemeralRunnerSet` Custom Resource Definition, the pod-bearing child
//! representing the runner pool for one spec generation.

use super::autoscalingrunnerset::TlsConfig;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-runner configuration shared by every runner the set stamps out
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct RunnerSpec {
    /// Remote scale-set registry endpoint URL
    #[serde(rename = "configUrl")]
    pub config_url: String,

    /// Name of the Secret holding the registry access token
    #[serde(rename = "configSecret")]
    pub config_secret: String,

    /// Remote scale-set id runners register themselves under
    #[serde(rename = "scaleSetId")]
    pub scale_set_id: i64,

    /// Custom TLS trust for the registry endpoint
    #[serde(default, rename = "serverTls", skip_serializing_if = "Option::is_none")]
    pub server_tls: Option<TlsConfig>,

    /// Pod template for each runner
    pub template: PodTemplateSpec,
}

/// `EphemeralRunnerSet` CRD for the current generation of the runner pool
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "runners.platform", version = "v1", kind = "EphemeralRunnerSet")]
#[kube(namespaced)]
#[kube(status = "EphemeralRunnerSetStatus")]
#[kube(printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentReplicas"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct EphemeralRunnerSetSpec {
    /// Desired replica count, driven by the listener after creation
    #[serde(default)]
    pub replicas: i32,

    /// Configuration applied to every runner in the set
    #[serde(rename = "runnerSpec")]
    pub runner_spec: RunnerSpec,
}

/// Observed runner counts, written by the runner-pool controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EphemeralRunnerSetStatus {
    /// Total live runners
    #[serde(default, rename = "currentReplicas")]
    pub current_replicas: i32,

    /// Runners created but not yet registered
    #[serde(default, rename = "pendingReplicas")]
    pub pending_replicas: i32,

    /// Runners executing a job
    #[serde(default, rename = "runningReplicas")]
    pub running_replicas: i32,

    /// Runners that terminated abnormally
    #[serde(default, rename = "failedReplicas")]
    pub failed_replicas: i32,
}
