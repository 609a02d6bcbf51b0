//! Status projection from the current child onto the root object.

use crate::crds::{AutoscalingRunnerSet, AutoscalingRunnerSetStatus, EphemeralRunnerSet};
use crate::scalesets::store::ResourceStore;
use crate::scalesets::types::Result;
use kube::ResourceExt;
use tracing::debug;

/// Project the observed runner counters from the current child. A missing
/// child or a child without status reports zeros, a healthy pass always
/// clears the failure message.
#[must_use]
pub fn observed_status(current: Option<&EphemeralRunnerSet>) -> AutoscalingRunnerSetStatus {
    let counters = current.and_then(|child| child.status.as_ref());

    AutoscalingRunnerSetStatus {
        current_runners: counters.map_or(0, |status| status.current_replicas),
        pending_runners: counters.map_or(0, |status| status.pending_replicas),
        running_runners: counters.map_or(0, |status| status.running_replicas),
        failed_runners: counters.map_or(0, |status| status.failed_replicas),
        message: None,
    }
}

/// Write the desired status if it differs from what the root already reports
pub async fn publish(
    store: &dyn ResourceStore,
    runner_set: &AutoscalingRunnerSet,
    namespace: &str,
    desired: AutoscalingRunnerSetStatus,
) -> Result<()> {
    if runner_set.status.as_ref() == Some(&desired) {
        return Ok(());
    }

    debug!(
        name = %runner_set.name_any(),
        current = desired.current_runners,
        pending = desired.pending_runners,
        running = desired.running_runners,
        failed = desired.failed_runners,
        "Updating runner set status"
    );
    store
        .patch_runner_set_status(namespace, &runner_set.name_any(), &desired)
        .await
}

/// Surface a configuration failure in `status.message`, keeping the last
/// observed counters in place
pub async fn record_failure(
    store: &dyn ResourceStore,
    runner_set: &AutoscalingRunnerSet,
    namespace: &str,
    message: String,
) -> Result<()> {
    let mut status = runner_set.status.clone().unwrap_or_default();
    if status.message.as_deref() == Some(message.as_str()) {
        return Ok(());
    }

    status.message = Some(message);
    store
        .patch_runner_set_status(namespace, &runner_set.name_any(), &status)
        .await
}
