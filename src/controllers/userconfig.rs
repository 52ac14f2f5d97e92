use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::Api;
use kube::core::{PartialObjectMeta, SelectorExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, reflector, watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::controllers::{
    assert_queryable, changed_predicate, enforce_config, ensure_deletion_change, entity_context,
    error_policy, finalize, initialize, manage_error, manage_success, Shared,
};
use crate::enforcer::render::RenderContext;
use crate::enforcer::selector::{compile_one, EntitySelector};
use crate::resources::users::{Identity, User};
use crate::resources::UserConfig;
use crate::{telemetry, Result};

struct Context {
    shared: Arc<Shared>,
    user_store: Store<PartialObjectMeta<User>>,
    identity_store: Store<Identity>,
}

#[instrument(skip(ctx, cfg), fields(trace_id))]
async fn reconcile(cfg: Arc<UserConfig>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.shared.metrics.count_and_measure::<UserConfig>();
    ctx.shared.diagnostics.write().await.last_event = Utc::now();

    let api: Api<UserConfig> = Api::all(ctx.shared.client.clone());
    info!("Reconciling UserConfig \"{}\"", cfg.name_any());

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

async fn enforce(ctx: &Context, cfg: &UserConfig) -> Result<Option<Action>> {
    let api: Api<UserConfig> = Api::all(ctx.shared.client.clone());
    if let Some(action) = initialize(&api, cfg).await? {
        return Ok(Some(action));
    }

    let users = ctx.user_store.state();
    let identities = ctx.identity_store.state();
    let entities = select_users(
        cfg,
        users.iter().map(|u| u.as_ref()),
        &identities.iter().map(|i| i.as_ref()).collect::<Vec<_>>(),
    )?;
    debug!(
        "UserConfig \"{}\" selects {} users",
        cfg.name_any(),
        entities.len()
    );

    enforce_config(&ctx.shared, cfg, &entities).await?;
    Ok(None)
}

/// A user is selected through its identities: the user must pass the label and
/// annotation selectors, and at least one identity referencing it (by UID)
/// must pass the extra-field selector and, when set, carry the configured
/// provider. The first matching identity, by name, supplies the `extra.*`
/// substitution fields.
fn select_users<'a>(
    cfg: &UserConfig,
    users: impl Iterator<Item = &'a PartialObjectMeta<User>>,
    identities: &[&Identity],
) -> Result<Vec<RenderContext>> {
    let selector = EntitySelector::compile(
        cfg.spec.selector.label_selector.as_ref(),
        cfg.spec.selector.annotation_selector.as_ref(),
    )?;
    let extra_selector = compile_one(cfg.spec.identity_extra_field_selector.as_ref())?;

    let mut selected = Vec::new();
    for user in users {
        if !selector.matches(user.labels(), user.annotations()) {
            continue;
        }
        let Some(uid) = user.uid() else { continue };

        let mut candidates: Vec<&&Identity> = identities
            .iter()
            .filter(|identity| {
                identity
                    .user
                    .as_ref()
                    .and_then(|r| r.uid.as_deref())
                    .is_some_and(|identity_uid| identity_uid == uid)
            })
            .filter(|identity| match cfg.spec.provider_name.as_deref() {
                // an empty provider name means no restriction, same as absent
                Some(provider) if !provider.is_empty() => identity.provider_name == provider,
                _ => true,
            })
            .filter(|identity| extra_selector.matches(&identity.extra))
            .collect();
        candidates.sort_by_key(|identity| identity.name_any());

        if let Some(identity) = candidates.first() {
            selected.push(entity_context(user, identity.extra.clone()));
        }
    }
    Ok(selected)
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let cfg_api = Api::<UserConfig>::all(shared.client.clone());
    assert_queryable(&cfg_api).await;

    let user_api = Api::<User>::all(shared.client.clone());
    let identity_api = Api::<Identity>::all(shared.client.clone());

    let (cfg_store, cfg_writer) = reflector::store();
    let cfg_stream = reflector(cfg_writer, watcher(cfg_api, watcher::Config::default()))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let (user_store, user_writer) = reflector::store();
    let user_stream = reflector(
        user_writer,
        metadata_watcher(user_api, watcher::Config::default()),
    )
    .map(ensure_deletion_change)
    .touched_objects()
    .default_backoff()
    .predicate_filter(changed_predicate);

    // identities carry the extra fields in their body, so a metadata watch is
    // not enough here
    let (identity_store, identity_writer) = reflector::store();
    let identity_stream = reflector(
        identity_writer,
        watcher(identity_api, watcher::Config::default()),
    )
    .touched_objects()
    .default_backoff();

    let user_mapper_store = cfg_store.clone();
    let identity_mapper_store = cfg_store.clone();
    let drift_trigger = shared.drift.subscribe::<UserConfig>();

    Controller::for_stream(cfg_stream, cfg_store)
        .shutdown_on_signal()
        .watches_stream(user_stream, move |_user| {
            user_mapper_store
                .state()
                .into_iter()
                .map(|cfg| ObjectRef::from_obj(cfg.as_ref()))
                .collect::<Vec<_>>()
        })
        .watches_stream(identity_stream, move |_identity| {
            identity_mapper_store
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
                user_store,
                identity_store,
            }),
        )
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::userconfigs::UserConfigSpec;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    fn meta_user(name: &str, uid: &str, labels: &[(&str, &str)]) -> PartialObjectMeta<User> {
        use kube::core::PartialObjectMetaExt;
        ObjectMeta {
            name: Some(name.into()),
            uid: Some(uid.into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
        .into_response_partial::<User>()
    }

    fn identity(
        name: &str,
        provider: &str,
        user_uid: &str,
        extra: &[(&str, &str)],
    ) -> Identity {
        Identity {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            provider_name: provider.into(),
            provider_user_name: name.into(),
            user: Some(ObjectReference {
                uid: Some(user_uid.into()),
                ..Default::default()
            }),
            extra: extra
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn config(spec: UserConfigSpec) -> UserConfig {
        UserConfig::new("cfg", spec)
    }

    fn extra_selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            match_expressions: None,
        }
    }

    #[test]
    fn user_without_identities_is_not_selected() {
        let cfg = config(UserConfigSpec::default());
        let users = [meta_user("alice", "u-1", &[])];
        let selected = select_users(&cfg, users.iter(), &[]).unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn identity_is_matched_by_uid_not_name() {
        let cfg = config(UserConfigSpec::default());
        let users = [meta_user("alice", "u-1", &[])];
        let wrong_uid = identity("ldap:alice", "ldap", "u-2", &[]);
        assert!(select_users(&cfg, users.iter(), &[&wrong_uid])
            .unwrap()
            .is_empty());

        let right_uid = identity("ldap:alice", "ldap", "u-1", &[]);
        let selected = select_users(&cfg, users.iter(), &[&right_uid]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "alice");
    }

    #[test]
    fn provider_name_restricts_the_identity_set() {
        let cfg = config(UserConfigSpec {
            provider_name: Some("corp-sso".into()),
            ..Default::default()
        });
        let users = [meta_user("alice", "u-1", &[])];
        let ldap = identity("ldap:alice", "ldap", "u-1", &[]);
        assert!(select_users(&cfg, users.iter(), &[&ldap]).unwrap().is_empty());

        let sso = identity("corp-sso:alice", "corp-sso", "u-1", &[]);
        assert_eq!(select_users(&cfg, users.iter(), &[&sso]).unwrap().len(), 1);
    }

    #[test]
    fn empty_provider_name_does_not_restrict() {
        let cfg = config(UserConfigSpec {
            provider_name: Some(String::new()),
            ..Default::default()
        });
        let users = [meta_user("alice", "u-1", &[])];
        let ldap = identity("ldap:alice", "ldap", "u-1", &[]);
        assert_eq!(select_users(&cfg, users.iter(), &[&ldap]).unwrap().len(), 1);
    }

    #[test]
    fn extra_field_selector_filters_identities() {
        let cfg = config(UserConfigSpec {
            identity_extra_field_selector: Some(extra_selector(&[("sandbox", "true")])),
            ..Default::default()
        });
        let users = [meta_user("alice", "u-1", &[])];

        let plain = identity("ldap:alice", "ldap", "u-1", &[]);
        assert!(select_users(&cfg, users.iter(), &[&plain])
            .unwrap()
            .is_empty());

        let sandboxed = identity("ldap:alice", "ldap", "u-1", &[("sandbox", "true")]);
        let selected = select_users(&cfg, users.iter(), &[&sandboxed]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].extra["sandbox"], "true");
    }

    #[test]
    fn first_identity_by_name_supplies_extra_fields() {
        let cfg = config(UserConfigSpec::default());
        let users = [meta_user("alice", "u-1", &[])];
        let b = identity("b-provider:alice", "b-provider", "u-1", &[("from", "b")]);
        let a = identity("a-provider:alice", "a-provider", "u-1", &[("from", "a")]);
        let selected = select_users(&cfg, users.iter(), &[&b, &a]).unwrap();
        assert_eq!(selected[0].extra["from"], "a");
    }

    #[test]
    fn user_label_selector_still_applies() {
        let cfg = config(UserConfigSpec {
            selector: crate::resources::EntityMatch {
                label_selector: Some(extra_selector(&[("team", "payments")])),
                annotation_selector: None,
            },
            ..Default::default()
        });
        let users = [
            meta_user("alice", "u-1", &[("team", "payments")]),
            meta_user("bob", "u-2", &[("team", "billing")]),
        ];
        let alice_id = identity("ldap:alice", "ldap", "u-1", &[]);
        let bob_id = identity("ldap:bob", "ldap", "u-2", &[]);
        let selected = select_users(&cfg, users.iter(), &[&alice_id, &bob_id]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "alice");
    }
}
