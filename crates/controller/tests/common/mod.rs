//! Shared test harness for reconcile tests.
//!
//! Provides an in-memory `ResourceStore` with API-server semantics
//! (generateName, finalizer-gated deletion, merge-patch annotations), a
//! scripted registry substitute, and fixtures for realistic objects. Every
//! mutation lands in a shared event log so tests can assert ordering across
//! the cluster and the registry.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PodSpec, PodTemplateSpec, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use runnerset_controller::crds::{
    AutoscalingRunnerSet, AutoscalingRunnerSetSpec, EphemeralRunnerSet, EphemeralRunnerSetStatus,
    Listener, TlsConfig,
};
use runnerset_controller::remote::{
    ClientSettings, NewScaleSet, RemoteError, RunnerGroup, ScaleSet, ScaleSetClient,
    ScaleSetClientFactory, ScaleSetUpdate,
};
use runnerset_controller::scalesets::config::{ControllerConfig, ImageConfig};
use runnerset_controller::scalesets::store::ResourceStore;
use runnerset_controller::scalesets::types::{Context, Result, RetryTracker};
use runnerset_controller::scalesets::{naming, reconcile_runner_set};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "ci";
pub const CONFIG_SECRET: &str = "registry-secret";
pub const REGISTRY_URL: &str = "https://registry.example.com/acme/ci";
pub const LISTENER_IMAGE: &str = "ghcr.io/runners-platform/listener:v0.3.1";
pub const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBCorp\n-----END CERTIFICATE-----\n";

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// ============================================================================
// In-memory cluster
// ============================================================================

#[derive(Default)]
struct ClusterState {
    runner_sets: BTreeMap<String, AutoscalingRunnerSet>,
    ephemeral_runner_sets: BTreeMap<String, EphemeralRunnerSet>,
    listeners: BTreeMap<String, Listener>,
    secrets: BTreeMap<String, Secret>,
    config_maps: BTreeMap<String, ConfigMap>,
    name_seq: u32,
}

/// `ResourceStore` over plain maps. Writes are counted so tests can prove a
/// steady pass performs none.
pub struct InMemoryStore {
    state: Mutex<ClusterState>,
    writes: AtomicUsize,
    events: Arc<Mutex<Vec<String>>>,
}

impl InMemoryStore {
    pub fn new(events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            writes: AtomicUsize::new(0),
            events,
        }
    }

    fn record(&self, event: String) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(event);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    // ---- seeding and direct inspection -------------------------------------

    pub fn put_root(&self, runner_set: AutoscalingRunnerSet) {
        let key = object_key(
            runner_set.namespace().unwrap().as_str(),
            &runner_set.name_any(),
        );
        self.state.lock().unwrap().runner_sets.insert(key, runner_set);
    }

    pub fn put_runner_set(&self, runner_set: EphemeralRunnerSet) {
        let key = object_key(
            runner_set.namespace().unwrap().as_str(),
            &runner_set.name_any(),
        );
        self.state
            .lock()
            .unwrap()
            .ephemeral_runner_sets
            .insert(key, runner_set);
    }

    pub fn put_secret(&self, namespace: &str, name: &str, secret: Secret) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(object_key(namespace, name), secret);
    }

    pub fn put_config_map(&self, namespace: &str, name: &str, config_map: ConfigMap) {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(object_key(namespace, name), config_map);
    }

    pub fn root(&self, namespace: &str, name: &str) -> Option<AutoscalingRunnerSet> {
        self.state
            .lock()
            .unwrap()
            .runner_sets
            .get(&object_key(namespace, name))
            .cloned()
    }

    pub fn runner_sets_in(&self, namespace: &str) -> Vec<EphemeralRunnerSet> {
        let prefix = format!("{namespace}/");
        self.state
            .lock()
            .unwrap()
            .ephemeral_runner_sets
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, rs)| rs.clone())
            .collect()
    }

    pub fn listener(&self, namespace: &str, name: &str) -> Option<Listener> {
        self.state
            .lock()
            .unwrap()
            .listeners
            .get(&object_key(namespace, name))
            .cloned()
    }

    /// Mutate the stored root in place, simulating an out-of-band edit
    pub fn update_root(
        &self,
        namespace: &str,
        name: &str,
        mutate: impl FnOnce(&mut AutoscalingRunnerSet),
    ) {
        let mut state = self.state.lock().unwrap();
        let runner_set = state
            .runner_sets
            .get_mut(&object_key(namespace, name))
            .expect("root not found");
        mutate(runner_set);
    }

    /// Simulate `kubectl delete`: finalizers keep the object around with a
    /// deletion timestamp, otherwise it disappears immediately.
    pub fn mark_root_deleted(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let key = object_key(namespace, name);
        let runner_set = state.runner_sets.get_mut(&key).expect("root not found");
        if runner_set.finalizers().is_empty() {
            state.runner_sets.remove(&key);
        } else {
            runner_set.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .remove(&object_key(namespace, name));
    }

    pub fn remove_listener(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .listeners
            .remove(&object_key(namespace, name));
    }

    pub fn set_child_status(&self, namespace: &str, name: &str, status: EphemeralRunnerSetStatus) {
        let mut state = self.state.lock().unwrap();
        let child = state
            .ephemeral_runner_sets
            .get_mut(&object_key(namespace, name))
            .expect("runner set not found");
        child.status = Some(status);
    }

    fn next_creation_time(seq: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(i64::from(seq))
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_runner_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AutoscalingRunnerSet>> {
        Ok(self.root(namespace, name))
    }

    async fn annotate_runner_set(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let runner_set = state
            .runner_sets
            .get_mut(&object_key(namespace, name))
            .expect("annotate on missing root");
        runner_set
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
        drop(state);
        self.record(format!("annotate-root {name}"));
        Ok(())
    }

    async fn set_runner_set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = object_key(namespace, name);
        let runner_set = state
            .runner_sets
            .get_mut(&key)
            .expect("finalizer patch on missing root");
        runner_set.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers)
        };

        let released = runner_set.metadata.deletion_timestamp.is_some()
            && runner_set.finalizers().is_empty();
        if released {
            state.runner_sets.remove(&key);
        }
        drop(state);

        self.record(if released {
            format!("release-finalizer {name}")
        } else {
            format!("set-finalizers {name}")
        });
        Ok(())
    }

    async fn patch_runner_set_status(
        &self,
        namespace: &str,
        name: &str,
        status: &runnerset_controller::crds::AutoscalingRunnerSetStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let runner_set = state
            .runner_sets
            .get_mut(&object_key(namespace, name))
            .expect("status patch on missing root");
        runner_set.status = Some(status.clone());
        drop(state);
        self.record(format!("patch-status {name}"));
        Ok(())
    }

    async fn list_ephemeral_runner_sets(
        &self,
        namespace: &str,
        owner: &str,
    ) -> Result<Vec<EphemeralRunnerSet>> {
        Ok(self
            .runner_sets_in(namespace)
            .into_iter()
            .filter(|rs| {
                rs.labels().get(naming::LABEL_SCALE_SET_NAME).map(String::as_str) == Some(owner)
            })
            .collect())
    }

    async fn create_ephemeral_runner_set(
        &self,
        runner_set: &EphemeralRunnerSet,
    ) -> Result<EphemeralRunnerSet> {
        let mut stored = runner_set.clone();
        let mut state = self.state.lock().unwrap();
        state.name_seq += 1;
        let seq = state.name_seq;

        if stored.metadata.name.is_none() {
            let prefix = stored.metadata.generate_name.clone().unwrap_or_default();
            stored.metadata.name = Some(format!("{prefix}{seq:05}"));
        }
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(Self::next_creation_time(seq)));

        let key = object_key(
            stored.metadata.namespace.as_deref().unwrap_or_default(),
            stored.metadata.name.as_deref().unwrap(),
        );
        assert!(
            !state.ephemeral_runner_sets.contains_key(&key),
            "create conflict for {key}"
        );
        state.ephemeral_runner_sets.insert(key, stored.clone());
        drop(state);

        self.record(format!("create-runner-set {}", stored.name_any()));
        Ok(stored)
    }

    async fn delete_ephemeral_runner_set(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .ephemeral_runner_sets
            .remove(&object_key(namespace, name));
        self.record(format!("delete-runner-set {name}"));
        Ok(())
    }

    async fn get_listener(&self, namespace: &str, name: &str) -> Result<Option<Listener>> {
        Ok(self.listener(namespace, name))
    }

    async fn create_listener(&self, listener: &Listener) -> Result<Listener> {
        let mut stored = listener.clone();
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));

        let key = object_key(
            stored.metadata.namespace.as_deref().unwrap_or_default(),
            stored.metadata.name.as_deref().expect("listener needs a name"),
        );
        let mut state = self.state.lock().unwrap();
        assert!(
            !state.listeners.contains_key(&key),
            "create conflict for {key}"
        );
        state.listeners.insert(key, stored.clone());
        drop(state);

        self.record(format!("create-listener {}", stored.name_any()));
        Ok(stored)
    }

    async fn delete_listener(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .listeners
            .remove(&object_key(namespace, name));
        self.record(format!("delete-listener {name}"));
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&object_key(namespace, name))
            .cloned())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&object_key(namespace, name))
            .cloned())
    }
}

// ============================================================================
// Scripted registry
// ============================================================================

/// Mutable registry state shared between the test and the fake client
pub struct RegistryState {
    pub groups: Vec<RunnerGroup>,
    pub scale_sets: BTreeMap<i64, ScaleSet>,
    next_id: i64,
    pub calls: Vec<String>,
    fail_next: Option<RemoteError>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            groups: vec![RunnerGroup {
                id: naming::DEFAULT_RUNNER_GROUP_ID,
                name: naming::DEFAULT_RUNNER_GROUP.to_string(),
            }],
            scale_sets: BTreeMap::new(),
            next_id: 1,
            calls: Vec::new(),
            fail_next: None,
        }
    }
}

impl RegistryState {
    pub fn add_group(&mut self, id: i64, name: &str) {
        self.groups.push(RunnerGroup {
            id,
            name: name.to_string(),
        });
    }

    pub fn inject_failure(&mut self, error: RemoteError) {
        self.fail_next = Some(error);
    }

    fn group_name(&self, id: i64) -> String {
        self.groups
            .iter()
            .find(|group| group.id == id)
            .map_or_else(|| format!("group-{id}"), |group| group.name.clone())
    }
}

/// `ScaleSetClient` over `RegistryState`, logging every call into the
/// shared event stream
pub struct FakeScaleSetClient {
    state: Arc<Mutex<RegistryState>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl FakeScaleSetClient {
    fn take_injected_failure(&self) -> Option<RemoteError> {
        self.state.lock().unwrap().fail_next.take()
    }

    fn log(&self, state: &mut RegistryState, call: String) {
        state.calls.push(call.clone());
        self.events.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ScaleSetClient for FakeScaleSetClient {
    async fn get_runner_group(&self, name: &str) -> std::result::Result<RunnerGroup, RemoteError> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        self.log(&mut state, format!("get-runner-group {name}"));
        state
            .groups
            .iter()
            .find(|group| group.name == name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("runner group {name}")))
    }

    async fn get_scale_set(
        &self,
        runner_group_id: i64,
        name: &str,
    ) -> std::result::Result<Option<ScaleSet>, RemoteError> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        self.log(&mut state, format!("get-scale-set {name}"));
        Ok(state
            .scale_sets
            .values()
            .find(|set| set.runner_group_id == runner_group_id && set.name == name)
            .cloned())
    }

    async fn create_scale_set(
        &self,
        scale_set: &NewScaleSet,
    ) -> std::result::Result<ScaleSet, RemoteError> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let created = ScaleSet {
            id,
            name: scale_set.name.clone(),
            runner_group_id: scale_set.runner_group_id,
            runner_group_name: state.group_name(scale_set.runner_group_id),
        };
        state.scale_sets.insert(id, created.clone());
        self.log(&mut state, format!("create-scale-set {} id={id}", created.name));
        Ok(created)
    }

    async fn update_scale_set(
        &self,
        id: i64,
        update: &ScaleSetUpdate,
    ) -> std::result::Result<ScaleSet, RemoteError> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        self.log(&mut state, format!("update-scale-set {id}"));
        let group_name = state.group_name(update.runner_group_id);
        let scale_set = state
            .scale_sets
            .get_mut(&id)
            .ok_or_else(|| RemoteError::NotFound(format!("scale set {id}")))?;
        scale_set.runner_group_id = update.runner_group_id;
        scale_set.runner_group_name = group_name;
        Ok(scale_set.clone())
    }

    async fn delete_scale_set(&self, id: i64) -> std::result::Result<(), RemoteError> {
        if let Some(error) = self.take_injected_failure() {
            return Err(error);
        }
        let mut state = self.state.lock().unwrap();
        state.scale_sets.remove(&id);
        self.log(&mut state, format!("delete-scale-set {id}"));
        Ok(())
    }
}

/// Factory handing out fake clients, recording how many builds happened and
/// the settings each build saw
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
    events: Arc<Mutex<Vec<String>>>,
    builds: Arc<AtomicUsize>,
    last_settings: Arc<Mutex<Option<ClientSettings>>>,
}

impl ScaleSetClientFactory for FakeRegistry {
    fn build(
        &self,
        settings: &ClientSettings,
    ) -> std::result::Result<Arc<dyn ScaleSetClient>, RemoteError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.last_settings.lock().unwrap() = Some(settings.clone());
        Ok(Arc::new(FakeScaleSetClient {
            state: self.state.clone(),
            events: self.events.clone(),
        }))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub registry: Arc<Mutex<RegistryState>>,
    pub builds: Arc<AtomicUsize>,
    pub last_settings: Arc<Mutex<Option<ClientSettings>>>,
    pub events: Arc<Mutex<Vec<String>>>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(InMemoryStore::new(events.clone()));
        let registry = Arc::new(Mutex::new(RegistryState::default()));
        let builds = Arc::new(AtomicUsize::new(0));
        let last_settings = Arc::new(Mutex::new(None));

        let mut config = ControllerConfig::default();
        config.listener.image = ImageConfig {
            repository: "ghcr.io/runners-platform/listener".to_string(),
            tag: "v0.3.1".to_string(),
        };

        let ctx = Arc::new(Context {
            store: store.clone(),
            remotes: Arc::new(runnerset_controller::remote::ClientCache::new(Arc::new(
                FakeRegistry {
                    state: registry.clone(),
                    events: events.clone(),
                    builds: builds.clone(),
                    last_settings: last_settings.clone(),
                },
            ))),
            config: Arc::new(config),
            retries: Arc::new(RetryTracker::default()),
        });

        Self {
            store,
            registry,
            builds,
            last_settings,
            events,
            ctx,
        }
    }

    pub fn seed_credentials(&self) {
        self.store
            .put_secret(NAMESPACE, CONFIG_SECRET, token_secret(b"corp-token"));
    }

    pub fn registry_calls(&self) -> Vec<String> {
        self.registry.lock().unwrap().calls.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// One reconcile pass against the latest stored root
pub async fn reconcile_once(
    harness: &Harness,
    name: &str,
) -> runnerset_controller::scalesets::types::Result<Action> {
    let root = harness
        .store
        .root(NAMESPACE, name)
        .expect("root disappeared");
    reconcile_runner_set(Arc::new(root), harness.ctx.clone()).await
}

/// Drive reconcile passes until a pass reports `await_change` without
/// mutating anything, or the root is gone. Panics if convergence takes
/// suspiciously many passes.
pub async fn settle(harness: &Harness, name: &str) -> usize {
    let mut passes = 0;
    loop {
        passes += 1;
        assert!(passes <= 32, "reconcile did not settle after 32 passes");

        let Some(root) = harness.store.root(NAMESPACE, name) else {
            return passes;
        };
        let writes_before = harness.store.writes();
        let action = reconcile_runner_set(Arc::new(root), harness.ctx.clone())
            .await
            .expect("reconcile pass failed");

        if action == Action::await_change() && harness.store.writes() == writes_before {
            return passes;
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn runner_pod_template() -> PodTemplateSpec {
    PodTemplateSpec {
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "runner".to_string(),
                image: Some("ghcr.io/acme/runner:2.311.0".to_string()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        ..PodTemplateSpec::default()
    }
}

pub fn runner_set(name: &str) -> AutoscalingRunnerSet {
    let mut root = AutoscalingRunnerSet::new(
        name,
        AutoscalingRunnerSetSpec {
            config_url: REGISTRY_URL.to_string(),
            config_secret: CONFIG_SECRET.to_string(),
            runner_group: None,
            min_runners: Some(1),
            max_runners: Some(10),
            server_tls: None,
            template: runner_pod_template(),
        },
    );
    root.metadata.namespace = Some(NAMESPACE.to_string());
    root.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
    root
}

pub fn runner_set_with_tls(name: &str, config_map: &str) -> AutoscalingRunnerSet {
    let mut root = runner_set(name);
    root.spec.server_tls = Some(TlsConfig {
        root_cas_config_map_ref: config_map.to_string(),
    });
    root
}

pub fn token_secret(token: &[u8]) -> Secret {
    Secret {
        data: Some(
            [(
                naming::SECRET_TOKEN_KEY.to_string(),
                ByteString(token.to_vec()),
            )]
            .into(),
        ),
        ..Secret::default()
    }
}

pub fn ca_config_map() -> ConfigMap {
    ConfigMap {
        data: Some(
            [(naming::CONFIG_MAP_CA_KEY.to_string(), CA_PEM.to_string())].into(),
        ),
        ..ConfigMap::default()
    }
}
