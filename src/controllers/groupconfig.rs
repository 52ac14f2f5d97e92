use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
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
use crate::resources::users::Group;
use crate::resources::GroupConfig;
use crate::{telemetry, Result};

struct Context {
    shared: Arc<Shared>,
    group_store: Store<PartialObjectMeta<Group>>,
}

#[instrument(skip(ctx, cfg), fields(trace_id))]
async fn reconcile(cfg: Arc<GroupConfig>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.shared.metrics.count_and_measure::<GroupConfig>();
    ctx.shared.diagnostics.write().await.last_event = Utc::now();

    let api: Api<GroupConfig> = Api::all(ctx.shared.client.clone());
    info!("Reconciling GroupConfig \"{}\"", cfg.name_any());

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

async fn enforce(ctx: &Context, cfg: &GroupConfig) -> Result<Option<Action>> {
    let api: Api<GroupConfig> = Api::all(ctx.shared.client.clone());
    if let Some(action) = initialize(&api, cfg).await? {
        return Ok(Some(action));
    }

    let selector = EntitySelector::compile(
        cfg.spec.selector.label_selector.as_ref(),
        cfg.spec.selector.annotation_selector.as_ref(),
    )?;
    let entities: Vec<_> = ctx
        .group_store
        .state()
        .into_iter()
        .filter(|group| selector.matches(group.labels(), group.annotations()))
        .map(|group| entity_context(group.as_ref(), BTreeMap::new()))
        .collect();
    debug!(
        "GroupConfig \"{}\" selects {} groups",
        cfg.name_any(),
        entities.len()
    );

    enforce_config(&ctx.shared, cfg, &entities).await?;
    Ok(None)
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let cfg_api = Api::<GroupConfig>::all(shared.client.clone());
    assert_queryable(&cfg_api).await;

    let group_api = Api::<Group>::all(shared.client.clone());

    let (cfg_store, cfg_writer) = reflector::store();
    let cfg_stream = reflector(cfg_writer, watcher(cfg_api, watcher::Config::default()))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let (group_store, group_writer) = reflector::store();
    let group_stream = reflector(
        group_writer,
        metadata_watcher(group_api, watcher::Config::default()),
    )
    .map(ensure_deletion_change)
    .touched_objects()
    .default_backoff()
    .predicate_filter(changed_predicate);

    let mapper_store = cfg_store.clone();
    let drift_trigger = shared.drift.subscribe::<GroupConfig>();

    Controller::for_stream(cfg_stream, cfg_store)
        .shutdown_on_signal()
        .watches_stream(group_stream, move |_group| {
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
            Arc::new(Context {
                shared,
                group_store,
            }),
        )
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}
