//! Desired-state synthesis for the owned children.
//!
//! The builders are pure: given the same root object and resolved identity
//! they return byte-identical desired specs (labels and annotations live in
//! sorted maps, every field is populated explicitly), which keeps diffing
//! deterministic. The partition function implements the identity rule for
//! children: the hash label decides "current", the newest creation wins ties.

use crate::crds::{
    AutoscalingRunnerSet, EphemeralRunnerSet, EphemeralRunnerSetSpec, Listener, ListenerSpec,
    RunnerSpec,
};
use crate::scalesets::types::{Error, Result};
use crate::scalesets::{hash, naming};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Live children split by identity against the current runner-spec hash
pub struct RunnerSetPartition {
    /// The child serving the current spec generation, if one exists
    pub current: Option<EphemeralRunnerSet>,

    /// Extra hash-matching children; converged away by deleting them
    pub duplicates: Vec<EphemeralRunnerSet>,

    /// Children from earlier spec generations, drained once the listener
    /// points at the current one
    pub superseded: Vec<EphemeralRunnerSet>,
}

/// Build the desired `EphemeralRunnerSet` for the root's current spec
pub fn desired_runner_set(
    runner_set: &AutoscalingRunnerSet,
    scale_set_id: i64,
) -> Result<EphemeralRunnerSet> {
    let name = runner_set.name_any();
    let namespace = runner_set
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let owner = runner_set
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("uid"))?;
    let spec_hash = hash::runner_spec_hash(runner_set)?;

    let mut labels = BTreeMap::new();
    labels.insert(naming::LABEL_SCALE_SET_NAME.to_string(), name.clone());
    labels.insert(naming::LABEL_RUNNER_SPEC_HASH.to_string(), spec_hash);

    Ok(EphemeralRunnerSet {
        metadata: ObjectMeta {
            generate_name: Some(naming::runner_set_generate_name(&name)),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: EphemeralRunnerSetSpec {
            replicas: runner_set.effective_min_runners(),
            runner_spec: RunnerSpec {
                config_url: runner_set.spec.config_url.clone(),
                config_secret: runner_set.spec.config_secret.clone(),
                scale_set_id,
                server_tls: runner_set.spec.server_tls.clone(),
                template: runner_set.spec.template.clone(),
            },
        },
        status: None,
    })
}

/// Build the desired `Listener` pointing at the current runner-set child
pub fn desired_listener(
    runner_set: &AutoscalingRunnerSet,
    scale_set_id: i64,
    current_runner_set: &str,
    image: &str,
) -> Result<Listener> {
    let name = runner_set.name_any();
    let namespace = runner_set
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let owner = runner_set
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("uid"))?;
    let config_hash = hash::listener_config_hash(runner_set, scale_set_id, image)?;

    let mut labels = BTreeMap::new();
    labels.insert(naming::LABEL_SCALE_SET_NAME.to_string(), name);

    let mut annotations = BTreeMap::new();
    annotations.insert(
        naming::ANNOTATION_LISTENER_CONFIG_HASH.to_string(),
        config_hash,
    );

    Ok(Listener {
        metadata: ObjectMeta {
            name: Some(runner_set.listener_name()),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: ListenerSpec {
            config_url: runner_set.spec.config_url.clone(),
            config_secret: runner_set.spec.config_secret.clone(),
            scale_set_id,
            ephemeral_runner_set_name: current_runner_set.to_string(),
            min_runners: runner_set.effective_min_runners(),
            max_runners: runner_set.effective_max_runners(),
            image: image.to_string(),
            server_tls: runner_set.spec.server_tls.clone(),
        },
    })
}

/// Whether the live listener still matches the current child and the
/// recomputed listener-relevant configuration
#[must_use]
pub fn listener_is_current(
    listener: &Listener,
    current_runner_set: &str,
    config_hash: &str,
) -> bool {
    listener.spec.ephemeral_runner_set_name == current_runner_set
        && listener
            .annotations()
            .get(naming::ANNOTATION_LISTENER_CONFIG_HASH)
            .is_some_and(|recorded| recorded == config_hash)
}

/// Drop label-matched children that are not actually owner-referenced by
/// this root (stale labels, manual copies)
#[must_use]
pub fn owned_runner_sets(
    owner: &AutoscalingRunnerSet,
    children: Vec<EphemeralRunnerSet>,
) -> Vec<EphemeralRunnerSet> {
    let Some(owner_uid) = owner.uid() else {
        return children;
    };

    children
        .into_iter()
        .filter(|child| {
            child
                .owner_references()
                .iter()
                .any(|reference| reference.uid == owner_uid)
        })
        .collect()
}

/// Split live children into current / duplicates / superseded. Terminating
/// children never count as current; among the hash matches the most recently
/// created wins, with the name as a deterministic tiebreak.
#[must_use]
pub fn partition_runner_sets(
    children: Vec<EphemeralRunnerSet>,
    desired_hash: &str,
) -> RunnerSetPartition {
    let mut matching = Vec::new();
    let mut superseded = Vec::new();

    for child in children {
        let is_current_generation = child.metadata.deletion_timestamp.is_none()
            && child
                .labels()
                .get(naming::LABEL_RUNNER_SPEC_HASH)
                .is_some_and(|label| label == desired_hash);

        if is_current_generation {
            matching.push(child);
        } else {
            superseded.push(child);
        }
    }

    matching.sort_by(|a, b| creation_key(b).cmp(&creation_key(a)));

    let mut matching = matching.into_iter();
    let current = matching.next();
    let duplicates: Vec<_> = matching.collect();

    RunnerSetPartition {
        current,
        duplicates,
        superseded,
    }
}

fn creation_key(runner_set: &EphemeralRunnerSet) -> (Option<DateTime<Utc>>, String) {
    (
        runner_set
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|time| time.0),
        runner_set.name_any(),
    )
}
