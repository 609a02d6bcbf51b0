//! Cluster access seam for the reconciler.
//!
//! Every local API interaction goes through `ResourceStore`, so the
//! reconcile logic can run against an in-memory store in tests. The kube
//! implementation maps 404s on reads to `None` and tolerates 404s on
//! deletes, keeping absence handling in one place.

use crate::crds::{AutoscalingRunnerSet, AutoscalingRunnerSetStatus, EphemeralRunnerSet, Listener};
use crate::scalesets::naming;
use crate::scalesets::types::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use kube::Error as KubeError;
use serde_json::json;
use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_runner_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AutoscalingRunnerSet>>;

    /// Merge the given annotations into the root object's metadata
    async fn annotate_runner_set(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Replace the root object's finalizer list
    async fn set_runner_set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn patch_runner_set_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AutoscalingRunnerSetStatus,
    ) -> Result<()>;

    /// List the runner-set children labeled as owned by `owner`
    async fn list_ephemeral_runner_sets(
        &self,
        namespace: &str,
        owner: &str,
    ) -> Result<Vec<EphemeralRunnerSet>>;

    async fn create_ephemeral_runner_set(
        &self,
        runner_set: &EphemeralRunnerSet,
    ) -> Result<EphemeralRunnerSet>;

    async fn delete_ephemeral_runner_set(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_listener(&self, namespace: &str, name: &str) -> Result<Option<Listener>>;

    async fn create_listener(&self, listener: &Listener) -> Result<Listener>;

    async fn delete_listener(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
}

/// `ResourceStore` backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn runner_sets(&self, namespace: &str) -> Api<AutoscalingRunnerSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn ephemeral_runner_sets(&self, namespace: &str) -> Api<EphemeralRunnerSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn listeners(&self, namespace: &str) -> Api<Listener> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(KubeError::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_runner_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AutoscalingRunnerSet>> {
        Ok(self.runner_sets(namespace).get_opt(name).await?)
    }

    async fn annotate_runner_set(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.runner_sets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn set_runner_set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.runner_sets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_runner_set_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AutoscalingRunnerSetStatus,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        self.runner_sets(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn list_ephemeral_runner_sets(
        &self,
        namespace: &str,
        owner: &str,
    ) -> Result<Vec<EphemeralRunnerSet>> {
        let selector = format!("{}={owner}", naming::LABEL_SCALE_SET_NAME);
        let params = ListParams::default().labels(&selector);
        Ok(self
            .ephemeral_runner_sets(namespace)
            .list(&params)
            .await?
            .items)
    }

    async fn create_ephemeral_runner_set(
        &self,
        runner_set: &EphemeralRunnerSet,
    ) -> Result<EphemeralRunnerSet> {
        let namespace = runner_set
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default();
        Ok(self
            .ephemeral_runner_sets(namespace)
            .create(&PostParams::default(), runner_set)
            .await?)
    }

    async fn delete_ephemeral_runner_set(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.ephemeral_runner_sets(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn get_listener(&self, namespace: &str, name: &str) -> Result<Option<Listener>> {
        Ok(self.listeners(namespace).get_opt(name).await?)
    }

    async fn create_listener(&self, listener: &Listener) -> Result<Listener> {
        let namespace = listener.metadata.namespace.as_deref().unwrap_or_default();
        Ok(self
            .listeners(namespace)
            .create(&PostParams::default(), listener)
            .await?)
    }

    async fn delete_listener(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.listeners(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
