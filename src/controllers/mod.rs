use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::discovery::Discovery;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::enforcer::adapters::AdapterRegistry;
use crate::enforcer::drift::DriftWatcher;
use crate::enforcer::render::{render, RenderContext};
use crate::enforcer::{apply, merge_default_exclusions, LockedResource};
use crate::resources::users::USER_API_GROUP;
use crate::resources::{ConfigObject, ConfigStatus, EnforcementState};
use crate::{Error, Metrics, Result};

pub mod groupconfig;
pub mod namespaceconfig;
pub mod userconfig;

pub static FIELD_MANAGER: &str = "kubenforce-operator";

/// Requeue interval after a successful reconcile.
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Backoff bounds after a failed reconcile. The delay doubles against the
/// time the previous failure was recorded.
const FAILURE_BACKOFF_SEED: Duration = Duration::from_secs(1);
const FAILURE_BACKOFF_CAP: Duration = Duration::from_secs(6 * 60 * 60);

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Allow templates to be enforced in default, kube-* and openshift-*
    /// namespaces
    allow_system_namespaces: bool,
}

impl State {
    pub fn with_allow_system_namespaces(mut self, allow: bool) -> Self {
        self.allow_system_namespaces = allow;
        self
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Pieces every config controller needs, shared behind one Arc.
pub(crate) struct Shared {
    pub client: Client,
    pub recorder: Recorder,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Metrics,
    /// Discovered API surface, refreshed when a desired kind fails to resolve
    pub discovery: RwLock<Discovery>,
    pub registry: AdapterRegistry,
    pub drift: DriftWatcher,
    pub allow_system_namespaces: bool,
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("failed to create kube client: {e:?}");
            std::process::exit(1);
        }
    };

    let discovery = match Discovery::new(client.clone()).run().await {
        Ok(discovery) => discovery,
        Err(e) => {
            error!("Could not run api discovery: {e:?}");
            std::process::exit(1);
        }
    };

    let user_api_served = discovery
        .groups()
        .any(|group| group.name() == USER_API_GROUP);
    if !user_api_served {
        warn!(
            "{} is not served by the apiserver; GroupConfig and UserConfig objects will not be reconciled",
            USER_API_GROUP
        );
    }

    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("failed to register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    let shared = Arc::new(Shared {
        client: client.clone(),
        recorder: Recorder::new(client.clone(), FIELD_MANAGER.into()),
        diagnostics: state.diagnostics.clone(),
        metrics,
        discovery: RwLock::new(discovery),
        registry: AdapterRegistry::default(),
        drift: DriftWatcher::new(client),
        allow_system_namespaces: state.allow_system_namespaces,
    });

    if user_api_served {
        tokio::join!(
            namespaceconfig::run(shared.clone()),
            groupconfig::run(shared.clone()),
            userconfig::run(shared),
        );
    } else {
        namespaceconfig::run(shared).await;
    }
}

/// Render every template against every selected entity. Per-pair failures are
/// collected; the remaining pairs still render.
pub(crate) fn render_desired<K: ConfigObject>(
    cfg: &K,
    entities: &[RenderContext],
    errors: &mut Vec<Error>,
) -> Vec<LockedResource> {
    let owner = cfg.owner_key();
    let mut desired = Vec::new();
    for entity in entities {
        for template in cfg.templates() {
            match render(&template.manifest, entity, &owner).and_then(|manifest| {
                LockedResource::from_manifest(manifest, template.excluded_paths.clone())
            }) {
                Ok(lr) => desired.push(lr),
                Err(e) => errors.push(e),
            }
        }
    }
    desired
}

/// The Active steady-state cycle after entity selection: render, enforce,
/// aggregate every error into one result.
pub(crate) async fn enforce_config<K: ConfigObject>(
    shared: &Shared,
    cfg: &K,
    entities: &[RenderContext],
) -> Result<()> {
    let mut errors = Vec::new();
    let desired = render_desired(cfg, entities, &mut errors);

    // A template may reference a kind installed after startup; re-run
    // discovery once before treating it as unknown.
    let stale = {
        let discovery = shared.discovery.read().await;
        desired.iter().any(|lr| discovery.resolve_gvk(&lr.gvk).is_none())
    };
    if stale {
        match Discovery::new(shared.client.clone()).run().await {
            Ok(refreshed) => *shared.discovery.write().await = refreshed,
            Err(e) => errors.push(e.into()),
        }
    }

    let discovery = shared.discovery.read().await;
    if let Err(e) = apply::enforce(
        &shared.client,
        &discovery,
        &shared.registry,
        &shared.drift,
        &cfg.owner_key(),
        desired,
    )
    .await
    {
        match e {
            Error::Aggregate(inner) => errors.extend(inner),
            e => errors.push(e),
        }
    }
    Error::aggregate(errors)
}

/// Normalizes a configuration object on first sight: merges the default
/// excluded paths into every template and attaches the finalizer iff any
/// template remains. Returns an action when a write was needed; full
/// reconciliation is deferred to the change event that write produces.
pub(crate) async fn initialize<K>(api: &Api<K>, cfg: &K) -> Result<Option<Action>>
where
    K: ConfigObject + Clone + DeserializeOwned + std::fmt::Debug,
{
    let mut templates = cfg.templates().to_vec();
    let mut templates_changed = false;
    for template in &mut templates {
        if let Some(merged) = merge_default_exclusions(&template.excluded_paths) {
            template.excluded_paths = merged;
            templates_changed = true;
        }
    }

    let has_finalizer = cfg.finalizers().iter().any(|f| f == K::FINALIZER);
    let want_finalizer = !templates.is_empty();
    if !templates_changed && has_finalizer == want_finalizer {
        return Ok(None);
    }

    let mut finalizers: Vec<String> = cfg
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != K::FINALIZER)
        .cloned()
        .collect();
    if want_finalizer {
        finalizers.push(K::FINALIZER.to_string());
    }

    info!("Initializing {} \"{}\"", K::kind(&()), cfg.name_any());
    let patch = json!({
        "metadata": { "finalizers": finalizers },
        "spec": { "templates": templates },
    });
    api.patch(
        &cfg.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(Some(Action::await_change()))
}

/// Finalizer-guarded cleanup. Deletes every resource still carrying the owner
/// label, then releases the finalizer. A 404 on release means the object was
/// already collected.
pub(crate) async fn finalize<K>(shared: &Shared, api: &Api<K>, cfg: &K) -> Result<Action>
where
    K: ConfigObject + Clone + DeserializeOwned + std::fmt::Debug,
{
    if !cfg.finalizers().iter().any(|f| f == K::FINALIZER) {
        return Ok(Action::await_change());
    }

    let owner = cfg.owner_key();
    let discovery = shared.discovery.read().await;
    let removed = apply::cleanup(&shared.client, &discovery, &owner).await?;
    drop(discovery);
    info!(
        "Cleaned up {} owned resources for {} \"{}\"",
        removed,
        K::kind(&()),
        cfg.name_any()
    );

    let finalizers: Vec<String> = cfg
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != K::FINALIZER)
        .cloned()
        .collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    match api
        .patch(
            &cfg.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

/// Record a successful cycle and settle into the periodic requeue.
pub(crate) async fn manage_success<K>(api: &Api<K>, cfg: &K) -> Result<Action>
where
    K: ConfigObject + Clone + DeserializeOwned + std::fmt::Debug,
{
    let status = ConfigStatus {
        last_update: Some(Time(Utc::now())),
        state: Some(EnforcementState::Success),
        reason: None,
    };
    patch_status(api, &cfg.name_any(), &status).await?;
    Ok(Action::requeue(STEADY_STATE_REQUEUE))
}

/// Record a failed cycle and requeue with a growing backoff. Consecutive
/// failures double the delay against the previously recorded failure time,
/// capped at six hours.
pub(crate) async fn manage_error<K>(
    shared: &Shared,
    api: &Api<K>,
    cfg: &K,
    err: Error,
) -> Result<Action>
where
    K: ConfigObject + Clone + DeserializeOwned + std::fmt::Debug,
{
    warn!(
        "reconcile of {} \"{}\" failed: {}",
        K::kind(&()),
        cfg.name_any(),
        err
    );
    shared
        .recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            },
            &cfg.object_ref(&()),
        )
        .await?;
    shared.metrics.reconcile_failure(cfg, &err);

    let backoff = failure_backoff(cfg.status(), Utc::now());
    let status = ConfigStatus {
        last_update: Some(Time(Utc::now())),
        state: Some(EnforcementState::Failure),
        reason: Some(err.to_string()),
    };
    patch_status(api, &cfg.name_any(), &status).await?;
    Ok(Action::requeue(backoff))
}

async fn patch_status<K>(api: &Api<K>, name: &str, status: &ConfigStatus) -> Result<()>
where
    K: ConfigObject + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "status": status,
    });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&patch),
    )
    .await?;
    Ok(())
}

fn failure_backoff(prev: Option<&ConfigStatus>, now: DateTime<Utc>) -> Duration {
    let last_failure = match prev {
        Some(ConfigStatus {
            state: Some(EnforcementState::Failure),
            last_update: Some(t),
            ..
        }) => t.0,
        _ => return FAILURE_BACKOFF_SEED,
    };
    let since = (now - last_failure).to_std().unwrap_or(Duration::ZERO);
    (since * 2).clamp(FAILURE_BACKOFF_SEED, FAILURE_BACKOFF_CAP)
}

pub(crate) fn error_policy<K, C>(_cfg: Arc<K>, _error: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}

// deletion apparently doesn't lead to any change in metadata otherwise, which
// means the changed_predicate would drop them.
pub(crate) fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<watcher::Event<K>, E>,
) -> Result<watcher::Event<K>, E> {
    if let Ok(watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

/// Skips reconciles for watch events that cannot change our output: only the
/// generation, labels, annotations, finalizers and deletion mark matter.
pub(crate) fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.finalizers().hash(&mut hasher);
    obj.meta().deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// Build the substitution context for one selected entity.
pub(crate) fn entity_context<K: Resource>(
    entity: &K,
    extra: std::collections::BTreeMap<String, String>,
) -> RenderContext {
    RenderContext {
        name: entity.name_any(),
        uid: entity.uid().unwrap_or_default(),
        labels: entity.labels().clone(),
        annotations: entity.annotations().clone(),
        extra,
    }
}

/// Check that a CRD this binary owns is actually served before starting its
/// controller.
pub(crate) async fn assert_queryable<K>(api: &Api<K>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Is the CRD installed?",
            K::kind(&())
        );
        std::process::exit(1);
    }
}
