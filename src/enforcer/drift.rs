use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use kube::api::{Api, ApiResource, DynamicObject};
use kube::client::Client;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc;
use tracing::*;

use super::{OwnerKey, OWNER_LABEL};

type Route = Box<dyn Fn(&str) + Send + Sync>;

/// Watches owned resources for drift and routes change notifications back to
/// the configuration object named in the owner label.
///
/// One metadata watch per resource kind, started lazily the first time the
/// engine applies that kind and kept for the process lifetime. Each
/// controller subscribes under its kind prefix and feeds the resulting stream
/// into `Controller::reconcile_on`.
pub struct DriftWatcher {
    client: Client,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    watched: HashSet<String>,
    routes: HashMap<String, Route>,
}

impl DriftWatcher {
    pub fn new(client: Client) -> Self {
        DriftWatcher {
            client,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Register the configuration kind `K` and return the stream of reconcile
    /// triggers for it. Configuration kinds are cluster-scoped.
    pub fn subscribe<K>(&self) -> impl Stream<Item = ObjectRef<K>>
    where
        K: Resource<DynamicType = ()> + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<ObjectRef<K>>();
        let prefix = K::kind(&()).to_lowercase();
        self.inner.lock().unwrap().routes.insert(
            prefix,
            Box::new(move |name| {
                let _ = tx.send(ObjectRef::new(name));
            }),
        );
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }

    /// Ensure a watch exists for this resource kind. Idempotent.
    pub fn watch(&self, ar: &ApiResource) {
        let key = format!("{}/{}/{}", ar.group, ar.version, ar.kind);
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.watched.insert(key) {
                return;
            }
        }
        info!("Watching {} for drift on owned resources", ar.kind);
        let client = self.client.clone();
        let ar = ar.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let api: Api<DynamicObject> = Api::all_with(client, &ar);
            let cfg = watcher::Config::default().labels(OWNER_LABEL);
            let mut stream = metadata_watcher(api, cfg)
                .touched_objects()
                .default_backoff()
                .boxed();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(meta) => {
                        let Some(owner) = meta
                            .labels()
                            .get(OWNER_LABEL)
                            .and_then(|value| OwnerKey::parse(value))
                        else {
                            continue;
                        };
                        let inner = inner.lock().unwrap();
                        if let Some(route) = inner.routes.get(&owner.kind) {
                            route(&owner.name);
                        }
                    }
                    Err(e) => {
                        debug!("drift watch error on {}: {e}", ar.kind);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::namespaceconfigs::NamespaceConfig;
    use futures::FutureExt;

    #[tokio::test]
    async fn routes_dispatch_to_the_registered_prefix() {
        // Exercise the routing table without a cluster.
        let inner = Arc::new(Mutex::new(Inner::default()));
        let (tx, mut rx) = mpsc::unbounded_channel::<ObjectRef<NamespaceConfig>>();
        inner.lock().unwrap().routes.insert(
            "namespaceconfig".to_string(),
            Box::new(move |name| {
                let _ = tx.send(ObjectRef::new(name));
            }),
        );

        let owner = OwnerKey::parse("namespaceconfig.cfg1").unwrap();
        {
            let inner = inner.lock().unwrap();
            inner.routes.get(&owner.kind).unwrap()("cfg1");
        }
        let got = rx.recv().now_or_never().flatten().unwrap();
        assert_eq!(got.name, "cfg1");

        // an owner of a different kind has no route here
        let other = OwnerKey::parse("groupconfig.cfg1").unwrap();
        assert!(inner.lock().unwrap().routes.get(&other.kind).is_none());
    }
}
