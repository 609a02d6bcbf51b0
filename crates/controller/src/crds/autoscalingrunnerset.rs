//! `AutoscalingRunnerSet` Custom Resource Definition, the root object owning
//! the runner pool and its listener.

use crate::scalesets::naming;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// TLS trust configuration for talking to the remote scale-set registry
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct TlsConfig {
    /// Name of a `ConfigMap` whose `ca.crt` entry holds a PEM root-CA bundle
    #[serde(rename = "rootCAsConfigMapRef")]
    pub root_cas_config_map_ref: String,
}

/// `AutoscalingRunnerSet` CRD describing one remote-registered pool of
/// ephemeral CI runners
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "runners.platform", version = "v1", kind = "AutoscalingRunnerSet")]
#[kube(namespaced)]
#[kube(status = "AutoscalingRunnerSetStatus")]
#[kube(printcolumn = r#"{"name":"Minimum","type":"integer","jsonPath":".spec.minRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Maximum","type":"integer","jsonPath":".spec.maxRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Pending","type":"integer","jsonPath":".status.pendingRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.runningRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.failedRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct AutoscalingRunnerSetSpec {
    /// Remote scale-set registry endpoint URL
    #[serde(rename = "configUrl")]
    pub config_url: String,

    /// Name of the Secret holding the registry access token under the `token` key
    #[serde(rename = "configSecret")]
    pub config_secret: String,

    /// Remote runner-group name; absent or empty selects the registry default group
    #[serde(default, rename = "runnerGroup", skip_serializing_if = "Option::is_none")]
    pub runner_group: Option<String>,

    /// Lower scaling bound advertised to the listener (default 0)
    #[serde(default, rename = "minRunners", skip_serializing_if = "Option::is_none")]
    pub min_runners: Option<i32>,

    /// Upper scaling bound advertised to the listener (default unbounded)
    #[serde(default, rename = "maxRunners", skip_serializing_if = "Option::is_none")]
    pub max_runners: Option<i32>,

    /// Custom TLS trust for the registry endpoint
    #[serde(default, rename = "serverTls", skip_serializing_if = "Option::is_none")]
    pub server_tls: Option<TlsConfig>,

    /// Pod template every runner in the pool is stamped from
    pub template: PodTemplateSpec,
}

/// Observed state rolled up from the current `EphemeralRunnerSet`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AutoscalingRunnerSetStatus {
    /// Total live runners in the current pool
    #[serde(default, rename = "currentRunners")]
    pub current_runners: i32,

    /// Runners created but not yet registered
    #[serde(default, rename = "pendingRunners")]
    pub pending_runners: i32,

    /// Runners executing a job
    #[serde(default, rename = "runningRunners")]
    pub running_runners: i32,

    /// Runners that terminated abnormally
    #[serde(default, rename = "failedRunners")]
    pub failed_runners: i32,

    /// Last permanent configuration failure, cleared on a successful pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AutoscalingRunnerSet {
    /// Runner-group name the spec asks for, with the registry default applied
    #[must_use]
    pub fn desired_runner_group(&self) -> &str {
        match self.spec.runner_group.as_deref() {
            Some(group) if !group.is_empty() => group,
            _ => naming::DEFAULT_RUNNER_GROUP,
        }
    }

    #[must_use]
    pub fn effective_min_runners(&self) -> i32 {
        self.spec.min_runners.unwrap_or(0)
    }

    #[must_use]
    pub fn effective_max_runners(&self) -> i32 {
        self.spec.max_runners.unwrap_or(i32::MAX)
    }

    /// Remote scale-set id memoized on the object, if the annotation is present
    /// and parseable
    #[must_use]
    pub fn scale_set_id(&self) -> Option<i64> {
        self.annotations()
            .get(naming::ANNOTATION_SCALE_SET_ID)
            .and_then(|raw| raw.parse().ok())
    }

    /// Remote runner-group name memoized on the object
    #[must_use]
    pub fn annotated_runner_group(&self) -> Option<&str> {
        self.annotations()
            .get(naming::ANNOTATION_RUNNER_GROUP)
            .map(String::as_str)
    }

    #[must_use]
    pub fn has_cleanup_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == naming::CLEANUP_FINALIZER)
    }

    /// Name of the Listener owned by this runner set
    #[must_use]
    pub fn listener_name(&self) -> String {
        naming::listener_name(&self.name_any())
    }
}
