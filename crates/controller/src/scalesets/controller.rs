//! Reconciliation for `AutoscalingRunnerSet` objects.
//!
//! Writes that change what later steps would read (finalizer, identity
//! patch, listener delete) end the pass early so the next one observes a
//! fresh object; the remaining convergence writes batch within one pass.
//! The ordering is fixed: cleanup, finalizer, remote
//! identity, runner-set children, listener, pruning, status. Remote
//! registration exists before any child that depends on it, and children
//! outlive the listener that scales them until a replacement is in place.

use crate::crds::{AutoscalingRunnerSet, EphemeralRunnerSet};
use crate::remote::{
    ClientSettings, NewScaleSet, RemoteError, RunnerGroup, ScaleSetClient, ScaleSetUpdate,
};
use crate::scalesets::types::{
    reconcile_key, Context, Error, Result, SETTLE_REQUEUE,
};
use crate::scalesets::{hash, naming, resources, status};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Outcome of the remote-identity step
enum RemoteIdentity {
    /// Identity annotations were just written; the watch delivers the
    /// annotated object for the next pass
    Patched,

    /// Identity is settled and matches the spec
    Ready { scale_set_id: i64 },
}

/// Reconcile one `AutoscalingRunnerSet` towards its declared state
#[instrument(skip(runner_set, ctx), fields(
    namespace = %runner_set.namespace().unwrap_or_default(),
    name = %runner_set.name_any(),
))]
pub async fn reconcile_runner_set(
    runner_set: Arc<AutoscalingRunnerSet>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let key = reconcile_key(&runner_set);
    let outcome = run_reconcile(&runner_set, &ctx).await;

    match &outcome {
        Ok(_) => ctx.retries.reset(&key),
        Err(error) if !error.is_transient() => {
            // Surface the configuration problem on the object itself; the
            // error still propagates so the long retry gets scheduled.
            let namespace = runner_set.namespace().unwrap_or_default();
            if let Err(patch_error) = status::record_failure(
                ctx.store.as_ref(),
                &runner_set,
                &namespace,
                error.to_string(),
            )
            .await
            {
                warn!(%patch_error, "failed to surface error in status");
            }
        }
        Err(_) => {}
    }

    outcome
}

async fn run_reconcile(runner_set: &AutoscalingRunnerSet, ctx: &Context) -> Result<Action> {
    let namespace = runner_set
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = runner_set.name_any();

    if runner_set.metadata.deletion_timestamp.is_some() {
        return cleanup(runner_set, ctx, &namespace).await;
    }

    // The finalizer lands before any side effect so a crash mid-pass still
    // leaves cleanup armed.
    if !runner_set.has_cleanup_finalizer() {
        let mut finalizers = runner_set.finalizers().to_vec();
        finalizers.push(naming::CLEANUP_FINALIZER.to_string());
        ctx.store
            .set_runner_set_finalizers(&namespace, &name, finalizers)
            .await?;
        debug!("armed cleanup finalizer");
        return Ok(Action::await_change());
    }

    let remote = registry_client(runner_set, ctx, &namespace).await?;

    let scale_set_id =
        match ensure_remote_identity(runner_set, ctx, &namespace, remote.as_ref()).await? {
            RemoteIdentity::Patched => return Ok(Action::await_change()),
            RemoteIdentity::Ready { scale_set_id } => scale_set_id,
        };

    let desired_hash = hash::runner_spec_hash(runner_set)?;
    let mut partition = resources::partition_runner_sets(
        list_owned(runner_set, ctx, &namespace).await?,
        &desired_hash,
    );

    if partition.current.is_none() {
        // Re-read right before creating; a concurrent pass or a stale list
        // may already have produced the current generation.
        partition = resources::partition_runner_sets(
            list_owned(runner_set, ctx, &namespace).await?,
            &desired_hash,
        );
    }

    let current = match partition.current.take() {
        Some(existing) => existing,
        None => {
            let desired = resources::desired_runner_set(runner_set, scale_set_id)?;
            let created = ctx.store.create_ephemeral_runner_set(&desired).await?;
            info!(runner_set = %created.name_any(), "created runner set for current spec");
            created
        }
    };

    let image = ctx.config.listener.image.reference();
    let listener_config_hash = hash::listener_config_hash(runner_set, scale_set_id, &image)?;
    let listener_name = runner_set.listener_name();
    let current_name = current.name_any();

    match ctx.store.get_listener(&namespace, &listener_name).await? {
        Some(listener)
            if resources::listener_is_current(&listener, &current_name, &listener_config_hash) => {}
        Some(_) => {
            // Stale listener. The old runner sets stay up during this gap so
            // capacity never drops to zero mid-rollout.
            info!(listener = %listener_name, "deleting out-of-date listener");
            ctx.store.delete_listener(&namespace, &listener_name).await?;
            return Ok(Action::requeue(SETTLE_REQUEUE));
        }
        None => {
            let desired =
                resources::desired_listener(runner_set, scale_set_id, &current_name, &image)?;
            ctx.store.create_listener(&desired).await?;
            info!(listener = %listener_name, runner_set = %current_name, "created listener");
        }
    }

    // The listener references the current child from here on, so everything
    // else can drain.
    for stale in partition
        .duplicates
        .into_iter()
        .chain(partition.superseded)
    {
        if stale.metadata.deletion_timestamp.is_some() {
            continue;
        }
        info!(runner_set = %stale.name_any(), "deleting runner set from a previous spec");
        ctx.store
            .delete_ephemeral_runner_set(&namespace, &stale.name_any())
            .await?;
    }

    status::publish(
        ctx.store.as_ref(),
        runner_set,
        &namespace,
        status::observed_status(Some(&current)),
    )
    .await?;

    Ok(Action::await_change())
}

/// Tear down in the reverse order of creation: listener, runner sets, the
/// remote registration, and only then the finalizer.
async fn cleanup(
    runner_set: &AutoscalingRunnerSet,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    if !runner_set.has_cleanup_finalizer() {
        return Ok(Action::await_change());
    }

    let listener_name = runner_set.listener_name();
    if ctx
        .store
        .get_listener(namespace, &listener_name)
        .await?
        .is_some()
    {
        info!(listener = %listener_name, "deleting listener before draining runners");
        ctx.store.delete_listener(namespace, &listener_name).await?;
        return Ok(Action::requeue(SETTLE_REQUEUE));
    }

    let children = list_owned(runner_set, ctx, namespace).await?;
    if !children.is_empty() {
        for child in &children {
            if child.metadata.deletion_timestamp.is_none() {
                ctx.store
                    .delete_ephemeral_runner_set(namespace, &child.name_any())
                    .await?;
            }
        }
        debug!(remaining = children.len(), "waiting for runner sets to drain");
        return Ok(Action::requeue(SETTLE_REQUEUE));
    }

    if let Some(scale_set_id) = runner_set.scale_set_id() {
        match registry_client(runner_set, ctx, namespace).await {
            Ok(remote) => {
                remote.delete_scale_set(scale_set_id).await?;
                info!(scale_set_id, "deleted remote scale set");
            }
            Err(Error::ConfigError(reason)) => {
                // Credentials are already gone. The remote entry cannot be
                // withdrawn any more and must not wedge deletion.
                warn!(scale_set_id, %reason, "skipping remote scale set deletion");
            }
            Err(Error::RemoteError(RemoteError::InvalidConfig(reason))) => {
                // Same class: the registry is permanently unreachable with
                // the recorded configuration.
                warn!(scale_set_id, %reason, "skipping remote scale set deletion");
            }
            Err(error) => return Err(error),
        }
    }

    let finalizers: Vec<String> = runner_set
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != naming::CLEANUP_FINALIZER)
        .cloned()
        .collect();
    ctx.store
        .set_runner_set_finalizers(namespace, &runner_set.name_any(), finalizers)
        .await?;
    info!("cleanup complete, released finalizer");

    Ok(Action::await_change())
}

/// Make sure the remote scale set exists and sits in the desired runner
/// group, and that both identity annotations record it.
async fn ensure_remote_identity(
    runner_set: &AutoscalingRunnerSet,
    ctx: &Context,
    namespace: &str,
    remote: &dyn ScaleSetClient,
) -> Result<RemoteIdentity> {
    let desired_group = runner_set.desired_runner_group();

    if let Some(scale_set_id) = runner_set.scale_set_id() {
        if runner_set.annotated_runner_group() == Some(desired_group) {
            return Ok(RemoteIdentity::Ready { scale_set_id });
        }

        // The group annotation disagrees with the spec, or is gone while
        // the id survived. Either way the registration exists, so move it
        // instead of recreating it and re-record the group.
        let group = resolve_runner_group(remote, desired_group).await?;
        match remote
            .update_scale_set(scale_set_id, &ScaleSetUpdate { runner_group_id: group.id })
            .await
        {
            Ok(updated) => {
                let mut annotations = BTreeMap::new();
                annotations.insert(
                    naming::ANNOTATION_RUNNER_GROUP.to_string(),
                    updated.runner_group_name,
                );
                ctx.store
                    .annotate_runner_set(namespace, &runner_set.name_any(), annotations)
                    .await?;
                info!(scale_set_id, group = desired_group, "moved scale set to runner group");
                return Ok(RemoteIdentity::Patched);
            }
            Err(RemoteError::NotFound(_)) => {
                warn!(
                    scale_set_id,
                    "recorded scale set no longer exists remotely, re-deriving identity"
                );
            }
            Err(error) => return Err(error.into()),
        }
    }

    bootstrap_identity(runner_set, ctx, namespace, remote, desired_group).await
}

/// Adopt or register the remote scale set and record its identity on the
/// root object in a single patch.
async fn bootstrap_identity(
    runner_set: &AutoscalingRunnerSet,
    ctx: &Context,
    namespace: &str,
    remote: &dyn ScaleSetClient,
    desired_group: &str,
) -> Result<RemoteIdentity> {
    let group = resolve_runner_group(remote, desired_group).await?;
    let name = runner_set.name_any();

    let scale_set = match remote.get_scale_set(group.id, &name).await? {
        Some(existing) => {
            debug!(scale_set_id = existing.id, "adopted existing scale set");
            existing
        }
        None => {
            let created = remote
                .create_scale_set(&NewScaleSet {
                    name: name.clone(),
                    runner_group_id: group.id,
                })
                .await?;
            info!(
                scale_set_id = created.id,
                group = %created.runner_group_name,
                "registered scale set"
            );
            created
        }
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(
        naming::ANNOTATION_SCALE_SET_ID.to_string(),
        scale_set.id.to_string(),
    );
    annotations.insert(
        naming::ANNOTATION_RUNNER_GROUP.to_string(),
        scale_set.runner_group_name,
    );
    ctx.store
        .annotate_runner_set(namespace, &name, annotations)
        .await?;

    Ok(RemoteIdentity::Patched)
}

/// Every registry carries the default group under a fixed id, so only
/// custom groups cost a lookup. Absent custom groups are a configuration
/// error, not something to retry hard.
async fn resolve_runner_group(
    remote: &dyn ScaleSetClient,
    desired_group: &str,
) -> Result<RunnerGroup> {
    if desired_group == naming::DEFAULT_RUNNER_GROUP {
        return Ok(RunnerGroup {
            id: naming::DEFAULT_RUNNER_GROUP_ID,
            name: naming::DEFAULT_RUNNER_GROUP.to_string(),
        });
    }
    Ok(remote.get_runner_group(desired_group).await?)
}

async fn list_owned(
    runner_set: &AutoscalingRunnerSet,
    ctx: &Context,
    namespace: &str,
) -> Result<Vec<EphemeralRunnerSet>> {
    let listed = ctx
        .store
        .list_ephemeral_runner_sets(namespace, &runner_set.name_any())
        .await?;
    Ok(resources::owned_runner_sets(runner_set, listed))
}

async fn registry_client(
    runner_set: &AutoscalingRunnerSet,
    ctx: &Context,
    namespace: &str,
) -> Result<Arc<dyn ScaleSetClient>> {
    let settings = client_settings(runner_set, ctx, namespace).await?;
    Ok(ctx.remotes.client_for(&settings).await?)
}

/// Resolve the credential and trust material referenced by the spec into
/// concrete client settings. Missing objects and keys are configuration
/// errors; the user has to fix them.
async fn client_settings(
    runner_set: &AutoscalingRunnerSet,
    ctx: &Context,
    namespace: &str,
) -> Result<ClientSettings> {
    let secret_name = &runner_set.spec.config_secret;
    let secret = ctx
        .store
        .get_secret(namespace, secret_name)
        .await?
        .ok_or_else(|| {
            Error::ConfigError(format!("config secret {namespace}/{secret_name} not found"))
        })?;

    let token = secret
        .data
        .as_ref()
        .and_then(|data| data.get(naming::SECRET_TOKEN_KEY))
        .map(|value| String::from_utf8_lossy(&value.0).trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "config secret {namespace}/{secret_name} has no usable \"{}\" key",
                naming::SECRET_TOKEN_KEY
            ))
        })?;

    let root_ca_pem = match &runner_set.spec.server_tls {
        Some(tls) => Some(root_ca_bundle(ctx, namespace, &tls.root_cas_config_map_ref).await?),
        None => None,
    };

    Ok(ClientSettings {
        endpoint: runner_set.spec.config_url.clone(),
        token,
        root_ca_pem,
        timeout: Duration::from_secs(ctx.config.remote.request_timeout_seconds),
    })
}

async fn root_ca_bundle(ctx: &Context, namespace: &str, name: &str) -> Result<Vec<u8>> {
    let config_map = ctx
        .store
        .get_config_map(namespace, name)
        .await?
        .ok_or_else(|| {
            Error::ConfigError(format!("TLS config map {namespace}/{name} not found"))
        })?;

    if let Some(bytes) = config_map
        .binary_data
        .as_ref()
        .and_then(|data| data.get(naming::CONFIG_MAP_CA_KEY))
    {
        return Ok(bytes.0.clone());
    }
    if let Some(text) = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(naming::CONFIG_MAP_CA_KEY))
    {
        return Ok(text.clone().into_bytes());
    }

    Err(Error::ConfigError(format!(
        "TLS config map {namespace}/{name} has no \"{}\" key",
        naming::CONFIG_MAP_CA_KEY
    )))
}
