use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::core::PartialObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, reflector, watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::controllers::{
    assert_queryable, changed_predicate, enforce_config, ensure_deletion_change, entity_context,
    error_policy, finalize, initialize, manage_error, manage_success, Shared,
};
use crate::enforcer::selector::EntitySelector;
use crate::resources::NamespaceConfig;
use crate::{telemetry, Result};

/// Namespaces the controller refuses to touch unless explicitly allowed.
fn is_system_namespace(name: &str) -> bool {
    name == "default" || name.starts_with("kube-") || name.starts_with("openshift-")
}

struct Context {
    shared: Arc<Shared>,
    ns_store: Store<PartialObjectMeta<Namespace>>,
}

#[instrument(skip(ctx, cfg), fields(trace_id))]
async fn reconcile(cfg: Arc<NamespaceConfig>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.shared.metrics.count_and_measure::<NamespaceConfig>();
    ctx.shared.diagnostics.write().await.last_event = Utc::now();

    let api: Api<NamespaceConfig> = Api::all(ctx.shared.client.clone());
    info!("Reconciling NamespaceConfig \"{}\"", cfg.name_any());

    // the triggering object may be stale; act on the latest version
    let Some(cfg) = api.get_opt(&cfg.name_any()).await? else {
        return Ok(Action::await_change());
    };

    if cfg.meta().deletion_timestamp.is_some() {
        return match finalize(&ctx.shared, &api, &cfg).await {
            Ok(action) => Ok(action),
            Err(e) => manage_error(&ctx.shared, &api, &cfg, e).await,
        };
    }

    match enforce(&ctx, &cfg).await {
        Ok(Some(action)) => Ok(action),
        Ok(None) => manage_success(&api, &cfg).await,
        Err(e) => manage_error(&ctx.shared, &api, &cfg, e).await,
    }
}

async fn enforce(
    ctx: &Context,
    cfg: &NamespaceConfig,
) -> Result<Option<Action>> {
    let api: Api<NamespaceConfig> = Api::all(ctx.shared.client.clone());
    if let Some(action) = initialize(&api, cfg).await? {
        return Ok(Some(action));
    }

    let selector = EntitySelector::compile(
        cfg.spec.selector.label_selector.as_ref(),
        cfg.spec.selector.annotation_selector.as_ref(),
    )?;
    let entities: Vec<_> = ctx
        .ns_store
        .state()
        .into_iter()
        .filter(|ns| ctx.shared.allow_system_namespaces || !is_system_namespace(&ns.name_any()))
        .filter(|ns| selector.matches(ns.labels(), ns.annotations()))
        .map(|ns| entity_context(ns.as_ref(), BTreeMap::new()))
        .collect();
    debug!(
        "NamespaceConfig \"{}\" selects {} namespaces",
        cfg.name_any(),
        entities.len()
    );

    enforce_config(&ctx.shared, cfg, &entities).await?;
    Ok(None)
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let cfg_api = Api::<NamespaceConfig>::all(shared.client.clone());
    assert_queryable(&cfg_api).await;

    let ns_api = Api::<Namespace>::all(shared.client.clone());

    let (cfg_store, cfg_writer) = reflector::store();
    let cfg_stream = reflector(cfg_writer, watcher(cfg_api, watcher::Config::default()))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let (ns_store, ns_writer) = reflector::store();
    let ns_stream = reflector(
        ns_writer,
        metadata_watcher(ns_api, watcher::Config::default()),
    )
    .map(ensure_deletion_change)
    .touched_objects()
    .default_backoff()
    .predicate_filter(changed_predicate);

    // any namespace change can move it in or out of any config's selection,
    // so every config is re-evaluated
    let mapper_store = cfg_store.clone();
    let drift_trigger = shared.drift.subscribe::<NamespaceConfig>();

    Controller::for_stream(cfg_stream, cfg_store)
        .shutdown_on_signal()
        .watches_stream(ns_stream, move |_ns| {
            mapper_store
                .state()
                .into_iter()
                .map(|cfg| ObjectRef::from_obj(cfg.as_ref()))
                .collect::<Vec<_>>()
        })
        .reconcile_on(drift_trigger)
        .run(
            reconcile,
            error_policy,
            Arc::new(Context { shared, ns_store }),
        )
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}
