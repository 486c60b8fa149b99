//! Feeds apiserver watch events into the [`Store`].

use std::{fmt::Debug, sync::Arc};

use futures::{future, StreamExt};
use k8s_openapi::{
    api::{
        core::v1::{Node, Secret, Service},
        networking::v1::Ingress,
    },
    NamespaceResourceScope,
};
use kube_client::{Api, Client};
use kube_core::Resource;
use kube_runtime::watcher;
use log::{error, info};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{CachedObject, Store},
    config::Config,
};

/// Watches services, secrets, nodes and ingresses until `shutdown` fires.
///
/// Ingresses are only watched once the other kinds completed their first
/// listing, so the first reconciliations see the full topology.
pub async fn run(client: Client, config: &Config, store: Arc<Store>, shutdown: CancellationToken) {
    let namespace = config.namespace.as_deref();
    let (services_listed, services_ready) = oneshot::channel();
    let (secrets_listed, secrets_ready) = oneshot::channel();
    let (nodes_listed, nodes_ready) = oneshot::channel();

    let ingresses = async {
        let _ = future::join3(services_ready, secrets_ready, nodes_ready).await;
        info!("Caches synced, watching ingresses");
        watch(
            namespaced::<Ingress>(&client, namespace),
            &store,
            None,
        )
        .await;
    };

    let watches = future::join4(
        watch(
            namespaced::<Service>(&client, namespace),
            &store,
            Some(services_listed),
        ),
        watch(
            namespaced::<Secret>(&client, namespace),
            &store,
            Some(secrets_listed),
        ),
        watch(Api::<Node>::all(client.clone()), &store, Some(nodes_listed)),
        ingresses,
    );

    tokio::select! {
        _ = shutdown.cancelled() => info!("Stopping watches"),
        _ = watches => {}
    }
}

fn namespaced<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

async fn watch<K>(api: Api<K>, store: &Store, mut listed: Option<oneshot::Sender<()>>)
where
    K: CachedObject + Debug + DeserializeOwned,
{
    let mut events = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if handle_event(store, event) {
                    if let Some(listed) = listed.take() {
                        let _ = listed.send(());
                    }
                }
            }
            Err(err) => error!("{} watcher failed: {err}", <K as CachedObject>::KIND),
        }
    }
}

/// Applies one watch event, returning whether it was a full listing.
fn handle_event<K: CachedObject>(store: &Store, event: watcher::Event<K>) -> bool {
    match event {
        watcher::Event::Applied(object) => store.apply(object),
        watcher::Event::Deleted(object) => store.delete(&object),
        watcher::Event::Restarted(objects) => {
            info!(
                "Listed {} {}(s)",
                objects.len(),
                <K as CachedObject>::KIND
            );
            store.replace(objects);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{fixtures::*, QualifiedName};

    #[tokio::test]
    async fn events_update_the_store() {
        let (store, queue) = store();
        store.apply(service("web", 80, Some(30000)));

        assert!(!handle_event(
            &store,
            watcher::Event::Applied(ingress("test-ingress", "example.com", "web", 80)),
        ));
        assert_eq!(store.list::<Ingress>().len(), 1);
        assert_eq!(queue.len(), 1);

        assert!(handle_event(
            &store,
            watcher::Event::Restarted(vec![service("api", 8080, Some(30001))]),
        ));
        assert!(store
            .get::<Service>(&QualifiedName::new("default", "web"))
            .unwrap_err()
            .is_not_found());
        assert_eq!(store.list::<Service>().len(), 1);

        let ing = ingress("test-ingress", "example.com", "web", 80);
        assert!(!handle_event(&store, watcher::Event::Deleted(ing)));
        assert!(store.list::<Ingress>().is_empty());
    }
}
