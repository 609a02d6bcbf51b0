//! Client cache keyed by endpoint, credential fingerprint, and trust
//! fingerprint.
//!
//! Reconciles for many runner sets share one cache; the common case is a
//! read-lock hit. Keys carry content fingerprints rather than secret names,
//! so rotating a credential naturally produces a new key. Stale entries for
//! the same endpoint are pruned on insert, and in-flight holders of the old
//! `Arc` are undisturbed.

use super::client::{ClientSettings, RemoteError, ScaleSetClient};
use crate::scalesets::hash;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Constructs clients on cache misses
pub trait ScaleSetClientFactory: Send + Sync {
    fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn ScaleSetClient>, RemoteError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClientKey {
    endpoint: String,
    token_fingerprint: String,
    ca_fingerprint: Option<String>,
}

impl ClientKey {
    fn for_settings(settings: &ClientSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            token_fingerprint: hash::content_fingerprint(settings.token.as_bytes()),
            ca_fingerprint: settings
                .root_ca_pem
                .as_deref()
                .map(hash::content_fingerprint),
        }
    }
}

/// Shared registry-client cache
pub struct ClientCache {
    factory: Arc<dyn ScaleSetClientFactory>,
    clients: RwLock<HashMap<ClientKey, Arc<dyn ScaleSetClient>>>,
}

impl ClientCache {
    #[must_use]
    pub fn new(factory: Arc<dyn ScaleSetClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached client for these settings, building and caching one
    /// on a miss. A miss for an endpoint that already has an entry means the
    /// credential or trust content changed; the superseded entry is dropped.
    pub async fn client_for(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn ScaleSetClient>, RemoteError> {
        let key = ClientKey::for_settings(settings);

        if let Some(client) = self.clients.read().await.get(&key) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        debug!(endpoint = %key.endpoint, "building registry client");
        let client = self.factory.build(settings)?;
        clients.retain(|existing, _| existing.endpoint != key.endpoint);
        clients.insert(key, client.clone());
        Ok(client)
    }
}
