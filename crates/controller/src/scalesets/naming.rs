//! Well-known names, labels, and annotation keys for runner-set resources.
//!
//! Everything the controller stamps onto objects or parses back off them is
//! defined here, so renames stay a one-file change.

const MAX_K8S_NAME_LENGTH: usize = 63;
const LISTENER_SUFFIX: &str = "-listener";

/// API group of every CRD this controller owns
pub const API_GROUP: &str = "runners.platform";

/// Finalizer gating deletion of an `AutoscalingRunnerSet` until cleanup ran
pub const CLEANUP_FINALIZER: &str = "autoscalingrunnerset.runners.platform/finalizer";

/// Label tying a child resource back to its owning runner set by name
pub const LABEL_SCALE_SET_NAME: &str = "runners.platform/scale-set-name";

/// Label carrying the runner-spec hash on an `EphemeralRunnerSet`; this is
/// the identity match key for "is this the current generation"
pub const LABEL_RUNNER_SPEC_HASH: &str = "runners.platform/runner-spec-hash";

/// Annotation memoizing the remote scale-set id on the root object
pub const ANNOTATION_SCALE_SET_ID: &str = "runners.platform/scale-set-id";

/// Annotation memoizing the remote runner-group name on the root object
pub const ANNOTATION_RUNNER_GROUP: &str = "runners.platform/runner-group";

/// Annotation recording the listener-relevant config digest on a `Listener`
pub const ANNOTATION_LISTENER_CONFIG_HASH: &str = "runners.platform/listener-config-hash";

/// Registry default runner group, resolved without a remote lookup
pub const DEFAULT_RUNNER_GROUP: &str = "default";
pub const DEFAULT_RUNNER_GROUP_ID: i64 = 1;

/// Secret data key holding the registry access token
pub const SECRET_TOKEN_KEY: &str = "token";

/// ConfigMap data key holding the PEM root-CA bundle
pub const CONFIG_MAP_CA_KEY: &str = "ca.crt";

/// Listener name derived from the owning runner set, length-bounded so
/// derived pod names stay inside the DNS label limit
pub fn listener_name(runner_set: &str) -> String {
    let available = MAX_K8S_NAME_LENGTH - LISTENER_SUFFIX.len();
    let base = if runner_set.len() > available {
        runner_set[..available].trim_end_matches('-')
    } else {
        runner_set
    };
    format!("{base}{LISTENER_SUFFIX}")
}

/// `generateName` prefix for `EphemeralRunnerSet` children; the API server
/// appends the unique suffix
pub fn runner_set_generate_name(runner_set: &str) -> String {
    format!("{runner_set}-")
}
