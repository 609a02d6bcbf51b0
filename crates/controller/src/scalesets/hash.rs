//! Deterministic digests over the configuration subsets that gate child
//! replacement.
//!
//! Two signals are deliberately decoupled: the runner-spec hash covers
//! everything that defines the running pod set (so scaling-bound edits leave
//! the pool alone), while the listener-config hash covers everything the
//! listener consumes except the pod template. Both are sha-1 over canonical
//! JSON: serde_json maps are ordered, struct fields serialize in declaration
//! order, and 40 hex chars fit inside a label value.

use crate::crds::{AutoscalingRunnerSet, TlsConfig};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::Serialize;
use sha1::{Digest, Sha1};

#[derive(Serialize)]
struct RunnerSpecProjection<'a> {
    config_url: &'a str,
    config_secret: &'a str,
    runner_group: &'a str,
    server_tls: Option<&'a TlsConfig>,
    template: &'a PodTemplateSpec,
}

#[derive(Serialize)]
struct ListenerConfigProjection<'a> {
    config_url: &'a str,
    config_secret: &'a str,
    runner_group: &'a str,
    server_tls: Option<&'a TlsConfig>,
    min_runners: i32,
    max_runners: i32,
    scale_set_id: i64,
    image: &'a str,
}

/// Digest of the fields whose change mandates replacing the pod-bearing
/// `EphemeralRunnerSet`. Excludes min/max bounds.
pub fn runner_spec_hash(
    runner_set: &AutoscalingRunnerSet,
) -> Result<String, serde_json::Error> {
    digest(&RunnerSpecProjection {
        config_url: &runner_set.spec.config_url,
        config_secret: &runner_set.spec.config_secret,
        runner_group: runner_set.desired_runner_group(),
        server_tls: runner_set.spec.server_tls.as_ref(),
        template: &runner_set.spec.template,
    })
}

/// Digest of the fields the listener consumes. Excludes the pod template so
/// template edits do not double-roll the listener through this signal.
pub fn listener_config_hash(
    runner_set: &AutoscalingRunnerSet,
    scale_set_id: i64,
    image: &str,
) -> Result<String, serde_json::Error> {
    digest(&ListenerConfigProjection {
        config_url: &runner_set.spec.config_url,
        config_secret: &runner_set.spec.config_secret,
        runner_group: runner_set.desired_runner_group(),
        server_tls: runner_set.spec.server_tls.as_ref(),
        min_runners: runner_set.effective_min_runners(),
        max_runners: runner_set.effective_max_runners(),
        scale_set_id,
        image,
    })
}

/// Fingerprint of raw credential or trust-bundle content, used in client
/// cache keys so rotation produces a new key
#[must_use]
pub fn content_fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

fn digest<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(value)?;
    Ok(content_fingerprint(&canonical))
}
