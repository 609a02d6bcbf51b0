//! Shared context and error types for the runner-set controllers.

use crate::crds::AutoscalingRunnerSet;
use crate::remote::{ClientCache, HttpClientFactory, RemoteError};
use crate::scalesets::config::ControllerConfig;
use crate::scalesets::store::{KubeResourceStore, ResourceStore};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requeue delay for permanent configuration errors; long enough to avoid a
/// hot loop, short enough to pick up out-of-band fixes (e.g. a recreated
/// secret) without a spec edit
pub const PERMANENT_RETRY: Duration = Duration::from_secs(300);

/// Short requeue used while waiting for a deletion or rollout step to settle
pub const SETTLE_REQUEUE: Duration = Duration::from_secs(1);

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 300;
const BACKOFF_MAX_SHIFT: u32 = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("remote scale-set registry error: {0}")]
    RemoteError(#[from] RemoteError),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Whether a bounded-backoff retry can make progress. Conflicts,
    /// timeouts, and remote 5xx are transient; configuration problems only
    /// resolve through an edit and must not hot-loop.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError(_) => true,
            Error::RemoteError(err) => err.is_transient(),
            Error::ConfigError(_) | Error::SerializationError(_) | Error::MissingObjectKey(_) => {
                false
            }
        }
    }
}

/// Shared state handed to every reconcile invocation
#[derive(Clone)]
pub struct Context {
    /// Cluster access behind a trait so tests can run against an in-memory store
    pub store: Arc<dyn ResourceStore>,

    /// Remote registry clients, cached per (endpoint, credential, trust) key
    pub remotes: Arc<ClientCache>,

    /// Controller configuration loaded at startup
    pub config: Arc<ControllerConfig>,

    /// Per-key transient-failure backoff state
    pub retries: Arc<RetryTracker>,
}

impl Context {
    #[must_use]
    pub fn new(client: kube::Client, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeResourceStore::new(client)),
            remotes: Arc::new(ClientCache::new(Arc::new(HttpClientFactory))),
            config: Arc::new(config),
            retries: Arc::new(RetryTracker::default()),
        }
    }
}

/// Stable per-object key used for backoff tracking and log correlation
#[must_use]
pub fn reconcile_key(runner_set: &AutoscalingRunnerSet) -> String {
    format!(
        "{}/{}",
        runner_set.namespace().unwrap_or_default(),
        runner_set.name_any()
    )
}

/// Tracks consecutive transient failures per object key and produces a
/// bounded exponential delay; reset on the first successful pass
#[derive(Default)]
pub struct RetryTracker {
    attempts: RwLock<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Record one more failure for `key` and return the delay before the
    /// next attempt: 1s, 2s, 4s, ... capped at five minutes
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut attempts = self
            .attempts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        let shift = (*count - 1).min(BACKOFF_MAX_SHIFT);
        let secs = (BACKOFF_BASE_SECS << shift).min(BACKOFF_CAP_SECS);
        Duration::from_secs(secs)
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
