use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::client::Client;
use kube::discovery::{verbs, Discovery, Scope};
use kube::ResourceExt;
use tracing::*;

use super::adapters::AdapterRegistry;
use super::diff::{self, OwnedObject, Plan, PlannedUpdate};
use super::drift::DriftWatcher;
use super::{LockedResource, OwnerKey};
use crate::{Error, Result};

/// Creates and updates run concurrently in batches of this size; large
/// selected-entity counts must not fan out unboundedly.
const APPLY_CONCURRENCY: usize = 4;

/// One enforcement pass: discover what we own, plan against the desired set,
/// apply the plan. Creates and updates complete before deletes start, so a
/// resource moving between entities never has zero live copies. All per-item
/// errors are aggregated; the plan is never aborted early.
pub async fn enforce(
    client: &Client,
    discovery: &Discovery,
    registry: &AdapterRegistry,
    drift: &DriftWatcher,
    owner: &OwnerKey,
    desired: Vec<LockedResource>,
) -> Result<()> {
    let mut errors = Vec::new();

    // Fail unsupported or unserved kinds up front so they are neither created
    // nor silently dropped from the diff.
    let mut admitted = Vec::with_capacity(desired.len());
    for lr in desired {
        if discovery.resolve_gvk(&lr.gvk).is_none() {
            errors.push(Error::UnknownKind(format!(
                "{}/{} {}",
                lr.gvk.group, lr.gvk.version, lr.gvk.kind
            )));
            continue;
        }
        if let Err(e) = registry.adapter_for(&lr.gvk.group, &lr.gvk.kind, &lr.manifest) {
            errors.push(e);
            continue;
        }
        admitted.push(lr);
    }

    let owned = find_owned(client, discovery, owner).await?;

    // Anything we own or are about to apply gets a drift watch.
    for obj in &owned {
        drift.watch(&obj.api_resource);
    }
    for lr in &admitted {
        if let Some((ar, _)) = discovery.resolve_gvk(&lr.gvk) {
            drift.watch(&ar);
        }
    }

    let (plan, plan_errors) = diff::plan(admitted, owned, registry);
    errors.extend(plan_errors);
    errors.extend(apply_plan(client, discovery, plan).await);

    Error::aggregate(errors)
}

async fn apply_plan(client: &Client, discovery: &Discovery, plan: Plan) -> Vec<Error> {
    let mut errors = Vec::new();

    errors.extend(
        futures::stream::iter(plan.creates)
            .map(|lr| create(client, discovery, lr))
            .buffer_unordered(APPLY_CONCURRENCY)
            .filter_map(|res| async move { res.err() })
            .collect::<Vec<_>>()
            .await,
    );
    errors.extend(
        futures::stream::iter(plan.updates)
            .map(|update| replace(client, update))
            .buffer_unordered(APPLY_CONCURRENCY)
            .filter_map(|res| async move { res.err() })
            .collect::<Vec<_>>()
            .await,
    );

    // Deletes run last and are best-effort
    let deletes = futures::stream::iter(plan.deletes)
        .map(|obj| delete_owned(client, obj))
        .buffer_unordered(APPLY_CONCURRENCY);
    errors.extend(
        deletes
            .filter_map(|res| async move { res.err() })
            .collect::<Vec<_>>()
            .await,
    );

    errors
}

async fn create(client: &Client, discovery: &Discovery, lr: LockedResource) -> Result<()> {
    let api = api_for(client, discovery, &lr)?;
    let obj: DynamicObject = serde_json::from_value(lr.manifest.clone())?;
    debug!("Creating {} {}", lr.gvk.kind, lr.name);
    match api.create(&PostParams::default(), &obj).await {
        Ok(_) => Ok(()),
        // lost a race with another actor; next cycle sees it as owned
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("{} {} already exists", lr.gvk.kind, lr.name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn replace(client: &Client, update: PlannedUpdate) -> Result<()> {
    let api: Api<DynamicObject> = match &update.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &update.api_resource),
        None => Api::all_with(client.clone(), &update.api_resource),
    };
    let obj: DynamicObject = serde_json::from_value(update.merged)?;
    debug!("Updating {} {}", update.api_resource.kind, update.name);
    // merged carries the live resourceVersion: a concurrent edit fails the
    // write and surfaces as drift on the next cycle
    api.replace(&update.name, &PostParams::default(), &obj)
        .await?;
    Ok(())
}

async fn delete_owned(client: &Client, obj: OwnedObject) -> Result<()> {
    let api: Api<DynamicObject> = match obj.object.namespace() {
        Some(ns) => Api::namespaced_with(client.clone(), &ns, &obj.api_resource),
        None => Api::all_with(client.clone(), &obj.api_resource),
    };
    let name = obj.object.name_any();
    debug!("Deleting {} {}", obj.api_resource.kind, name);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn api_for(client: &Client, discovery: &Discovery, lr: &LockedResource) -> Result<Api<DynamicObject>> {
    let (ar, caps) = discovery
        .resolve_gvk(&lr.gvk)
        .ok_or_else(|| Error::UnknownKind(lr.gvk.kind.clone()))?;
    match (&caps.scope, &lr.namespace) {
        (Scope::Namespaced, Some(ns)) => Ok(Api::namespaced_with(client.clone(), ns, &ar)),
        (Scope::Namespaced, None) => Err(Error::InvalidManifest(format!(
            "{} {} is namespaced but the rendered manifest has no metadata.namespace",
            lr.gvk.kind, lr.name
        ))),
        (Scope::Cluster, _) => Ok(Api::all_with(client.clone(), &ar)),
    }
}

/// Re-discover every resource carrying the owner label by scanning all
/// listable kinds the API server serves, never a cached list. This also finds
/// resources orphaned by template removal or earlier partial failures.
pub async fn find_owned(
    client: &Client,
    discovery: &Discovery,
    owner: &OwnerKey,
) -> Result<Vec<OwnedObject>> {
    let lp = ListParams::default().labels(&owner.label_selector());
    let mut owned = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::DELETE) {
                continue;
            }
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            match api.list(&lp).await {
                Ok(list) => owned.extend(list.items.into_iter().map(|object| OwnedObject {
                    api_resource: ar.clone(),
                    object,
                })),
                // kinds that advertise list but refuse it (aggregated APIs mid-rollout)
                Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 405 => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(owned)
}

/// Finalizer-guarded cleanup: delete everything still carrying the owner
/// label. Resources already gone count as cleaned.
pub async fn cleanup(client: &Client, discovery: &Discovery, owner: &OwnerKey) -> Result<usize> {
    let owned = find_owned(client, discovery, owner).await?;
    let total = owned.len();
    let mut errors = Vec::new();
    for obj in owned {
        if let Err(e) = delete_owned(client, obj).await {
            errors.push(e);
        }
    }
    Error::aggregate(errors)?;
    Ok(total)
}
