//! Scale-set fleet management: the `AutoscalingRunnerSet` controller and
//! everything it needs to converge roots, children, and listeners.

pub mod config;
pub mod controller;
pub mod hash;
pub mod naming;
pub mod resources;
pub mod status;
pub mod store;
pub mod types;

pub use config::ControllerConfig;
pub use controller::reconcile_runner_set;
pub use types::{Context, Error, Result};

use crate::crds::{AutoscalingRunnerSet, EphemeralRunnerSet, Listener};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Watch `AutoscalingRunnerSet` objects in one namespace and reconcile them
/// until the process receives a shutdown signal.
#[instrument(skip(client), fields(namespace = %namespace))]
pub async fn run_scale_set_controller(client: Client, namespace: String) -> Result<()> {
    let config = ControllerConfig::load();
    config
        .validate()
        .map_err(|error| Error::ConfigError(error.to_string()))?;

    info!(
        listener_image = %config.listener.image.reference(),
        "starting scale set controller"
    );

    let ctx = Arc::new(Context::new(client.clone(), config));

    let runner_sets: Api<AutoscalingRunnerSet> = Api::namespaced(client.clone(), &namespace);
    match runner_sets.list(&ListParams::default()).await {
        Ok(existing) => {
            info!(count = existing.items.len(), "found existing runner sets");
            for runner_set in &existing.items {
                debug!(name = %runner_set.name_any(), "watching runner set");
            }
        }
        Err(error) => warn!(%error, "failed to list existing runner sets"),
    }

    let children: Api<EphemeralRunnerSet> = Api::namespaced(client.clone(), &namespace);
    let listeners: Api<Listener> = Api::namespaced(client, &namespace);

    Controller::new(runner_sets, watcher::Config::default().any_semantic())
        .owns(children, watcher::Config::default())
        .owns(listeners, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_runner_set, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(name = %object.name, "reconciled runner set"),
                Err(error) => warn!(%error, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

/// Transient failures back off exponentially per object. Configuration
/// failures wait for the user, with a slow retry in case the referenced
/// object shows up on its own.
fn error_policy(
    runner_set: Arc<AutoscalingRunnerSet>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    let key = types::reconcile_key(&runner_set);

    if error.is_transient() {
        let delay = ctx.retries.next_delay(&key);
        warn!(%key, %error, ?delay, "transient reconcile failure, backing off");
        Action::requeue(delay)
    } else {
        error!(%key, %error, "reconcile blocked on configuration, waiting for a fix");
        Action::requeue(types::PERMANENT_RETRY)
    }
}
