//! Local mirror of the cluster objects the controller reacts to.
//!
//! Every change fed into the [`Store`] is translated into the ingress keys it
//! affects, which are pushed onto the [`RetryQueue`]. Services and secrets are
//! joined back to ingresses through two secondary indexes, so churn on objects
//! no ingress references never produces work.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use k8s_openapi::api::{
    core::v1::{Node, Secret, Service},
    networking::v1::Ingress,
};
use kube_core::Resource;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::{
    config::Config,
    error::{Error, Result},
    ingress,
    queue::RetryQueue,
};

mod topology;
pub use topology::{routable_address, ServiceEndpointInfo, CONTROL_PLANE_LABELS};

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.meta().name.clone().unwrap_or_default(),
        }
    }

    /// Parses a `namespace/name` or `name` key.
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::cluster_scoped(key),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The object kinds mirrored by the [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Ingress,
    Service,
    Secret,
    Node,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ingress => "ingress",
            Self::Service => "service",
            Self::Secret => "secret",
            Self::Node => "node",
        })
    }
}

type Table<K> = RwLock<HashMap<QualifiedName, Arc<K>>>;

/// An object kind held by the [`Store`].
pub trait CachedObject: Resource + Clone + PartialEq + Send + Sync + 'static {
    const KIND: Kind;

    #[doc(hidden)]
    fn table(store: &Store) -> &Table<Self>;

    /// Ingress keys to reconcile after this object moved from `old` to `new`.
    #[doc(hidden)]
    fn affected(store: &Store, old: Option<&Self>, new: Option<&Self>) -> Vec<QualifiedName>;
}

#[derive(Default)]
struct Indexes {
    by_service: HashMap<QualifiedName, BTreeSet<QualifiedName>>,
    by_secret: HashMap<QualifiedName, BTreeSet<QualifiedName>>,
    /// Services and secrets each indexed ingress was filed under.
    filed: HashMap<QualifiedName, (Vec<QualifiedName>, Vec<QualifiedName>)>,
}

impl Indexes {
    fn remove(&mut self, ingress: &QualifiedName) {
        let Some((services, secrets)) = self.filed.remove(ingress) else {
            return;
        };
        for (index, keys) in [(&mut self.by_service, services), (&mut self.by_secret, secrets)] {
            for key in keys {
                if let Some(ingresses) = index.get_mut(&key) {
                    ingresses.remove(ingress);
                    if ingresses.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    fn insert(&mut self, key: QualifiedName, services: Vec<QualifiedName>, secrets: Vec<QualifiedName>) {
        for service in &services {
            self.by_service
                .entry(service.clone())
                .or_default()
                .insert(key.clone());
        }
        for secret in &secrets {
            self.by_secret
                .entry(secret.clone())
                .or_default()
                .insert(key.clone());
        }
        self.filed.insert(key, (services, secrets));
    }
}

/// Eventually consistent cache of ingresses, services, secrets and nodes.
pub struct Store {
    ingress_class: String,
    cert_prefix: String,
    queue: Arc<RetryQueue<QualifiedName>>,
    ingresses: Table<Ingress>,
    services: Table<Service>,
    secrets: Table<Secret>,
    nodes: Table<Node>,
    indexes: Mutex<Indexes>,
}

impl Store {
    pub fn new(config: &Config, queue: Arc<RetryQueue<QualifiedName>>) -> Self {
        Self {
            ingress_class: config.ingress_class().to_owned(),
            cert_prefix: config.cert_manager_prefix.clone(),
            queue,
            ingresses: Table::default(),
            services: Table::default(),
            secrets: Table::default(),
            nodes: Table::default(),
            indexes: Mutex::default(),
        }
    }

    /// Returns the object matching `key`.
    pub fn get<K: CachedObject>(&self, key: &QualifiedName) -> Result<Arc<K>> {
        K::table(self)
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub fn list<K: CachedObject>(&self) -> Vec<Arc<K>> {
        K::table(self).read().values().cloned().collect()
    }

    /// Records an added or updated object, replacing any previous version.
    pub fn apply<K: CachedObject>(&self, object: K) {
        let key = QualifiedName::from_resource(&object);
        let object = Arc::new(object);
        let old = K::table(self).write().insert(key, Arc::clone(&object));
        self.enqueue(K::affected(self, old.as_deref(), Some(&object)));
    }

    /// Records a deleted object.
    pub fn delete<K: CachedObject>(&self, object: &K) {
        let key = QualifiedName::from_resource(object);
        let old = K::table(self).write().remove(&key);
        let old = old.as_deref().unwrap_or(object);
        self.enqueue(K::affected(self, Some(old), None));
    }

    /// Replaces every object of a kind after a relist; objects missing from `objects` count as deleted.
    pub fn replace<K: CachedObject>(&self, objects: Vec<K>) {
        let fresh: BTreeSet<_> = objects.iter().map(QualifiedName::from_resource).collect();
        let gone: Vec<_> = K::table(self)
            .read()
            .iter()
            .filter(|(key, _)| !fresh.contains(*key))
            .map(|(_, object)| Arc::clone(object))
            .collect();

        for object in gone {
            self.delete(object.as_ref());
        }
        for object in objects {
            self.apply(object);
        }
    }

    /// Whether the ingress belongs to this controller's class.
    pub fn is_controlled(&self, object: &Ingress) -> bool {
        ingress::is_controlled(object, &self.ingress_class)
    }

    /// Ingresses routing to the service `key`.
    pub fn ingresses_for_service(&self, key: &QualifiedName) -> Vec<QualifiedName> {
        Self::lookup(&self.indexes.lock().by_service, key)
    }

    /// Ingresses reading certificates from the secret `key`.
    pub fn ingresses_for_secret(&self, key: &QualifiedName) -> Vec<QualifiedName> {
        Self::lookup(&self.indexes.lock().by_secret, key)
    }

    fn lookup(
        index: &HashMap<QualifiedName, BTreeSet<QualifiedName>>,
        key: &QualifiedName,
    ) -> Vec<QualifiedName> {
        index
            .get(key)
            .map(|ingresses| ingresses.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn controlled_ingresses(&self) -> Vec<QualifiedName> {
        self.ingresses
            .read()
            .iter()
            .filter(|(_, object)| self.is_controlled(object))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn reindex(&self, key: &QualifiedName, object: Option<&Ingress>) {
        let mut indexes = self.indexes.lock();
        indexes.remove(key);

        let Some(object) = object else {
            return;
        };
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let services = ingress::service_backends(object)
            .map(|backend| QualifiedName::new(&namespace, &backend.name))
            .collect();
        let secrets = ingress::secret_names(object, &self.cert_prefix)
            .map(|name| QualifiedName::new(&namespace, name))
            .collect();
        indexes.insert(key.clone(), services, secrets);
    }

    fn enqueue(&self, keys: Vec<QualifiedName>) {
        for key in keys {
            self.queue.add(key);
        }
    }
}

impl CachedObject for Ingress {
    const KIND: Kind = Kind::Ingress;

    fn table(store: &Store) -> &Table<Self> {
        &store.ingresses
    }

    fn affected(store: &Store, old: Option<&Self>, new: Option<&Self>) -> Vec<QualifiedName> {
        let Some(key) = new.or(old).map(QualifiedName::from_resource) else {
            return Vec::new();
        };
        store.reindex(&key, new);

        let (scheduled, reason) = match (old, new) {
            (Some(old), Some(new)) if old == new => return Vec::new(),
            (Some(old), Some(new)) => (
                store.is_controlled(old) || store.is_controlled(new),
                "UpdateScheduled",
            ),
            (None, Some(new)) => (store.is_controlled(new), "CreateScheduled"),
            (Some(old), None) => (store.is_controlled(old), "DeleteScheduled"),
            (None, None) => return Vec::new(),
        };

        if !scheduled {
            debug!(
                "Ignoring ingress {key} based on class, expected {:?}",
                store.ingress_class
            );
            return Vec::new();
        }
        debug!("{reason}: ingress {key}");
        vec![key]
    }
}

impl CachedObject for Service {
    const KIND: Kind = Kind::Service;

    fn table(store: &Store) -> &Table<Self> {
        &store.services
    }

    fn affected(store: &Store, old: Option<&Self>, new: Option<&Self>) -> Vec<QualifiedName> {
        if old == new {
            return Vec::new();
        }
        let Some(key) = new.or(old).map(QualifiedName::from_resource) else {
            return Vec::new();
        };
        let ingresses = store.ingresses_for_service(&key);
        for ingress in &ingresses {
            debug!("Service {key} was changed, enqueuing associated ingress {ingress}");
        }
        ingresses
    }
}

impl CachedObject for Secret {
    const KIND: Kind = Kind::Secret;

    fn table(store: &Store) -> &Table<Self> {
        &store.secrets
    }

    fn affected(store: &Store, old: Option<&Self>, new: Option<&Self>) -> Vec<QualifiedName> {
        if old == new {
            return Vec::new();
        }
        let Some(key) = new.or(old).map(QualifiedName::from_resource) else {
            return Vec::new();
        };
        let ingresses = store.ingresses_for_secret(&key);
        for ingress in &ingresses {
            debug!("Secret {key} was changed, enqueuing associated ingress {ingress}");
        }
        ingresses
    }
}

impl CachedObject for Node {
    const KIND: Kind = Kind::Node;

    fn table(store: &Store) -> &Table<Self> {
        &store.nodes
    }

    fn affected(store: &Store, old: Option<&Self>, new: Option<&Self>) -> Vec<QualifiedName> {
        if old.and_then(routable_address) == new.and_then(routable_address) {
            return Vec::new();
        }
        let ingresses = store.controlled_ingresses();
        debug!(
            "Node topology changed, enqueuing {} ingress(es)",
            ingresses.len()
        );
        ingresses
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::{
            core::v1::{NodeAddress, NodeStatus, ServicePort, ServiceSpec},
            networking::v1::{
                HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
                IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
            },
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
        ByteString,
    };

    use super::*;

    pub const CLASS: &str = "serverscom";

    pub fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: namespace.map(str::to_owned),
            name: Some(name.to_owned()),
            uid: Some(format!("{name}-0000-1111-2222")),
            ..Default::default()
        }
    }

    /// An ingress of the default class routing `host` to `service:port`.
    pub fn ingress(name: &str, host: &str, service: &str, port: i32) -> Ingress {
        Ingress {
            metadata: meta(Some("default"), name),
            spec: Some(IngressSpec {
                ingress_class_name: Some(CLASS.to_owned()),
                rules: Some(vec![IngressRule {
                    host: Some(host.to_owned()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![path("/", service, port)],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn path(path: &str, service: &str, port: i32) -> HTTPIngressPath {
        HTTPIngressPath {
            path: Some(path.to_owned()),
            path_type: "Prefix".to_owned(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service.to_owned(),
                    port: Some(ServiceBackendPort {
                        number: Some(port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        }
    }

    pub fn with_tls(mut ingress: Ingress, hosts: &[&str], secret: &str) -> Ingress {
        let spec = ingress.spec.get_or_insert_with(Default::default);
        spec.tls.get_or_insert_with(Vec::new).push(IngressTLS {
            hosts: Some(hosts.iter().map(|host| host.to_string()).collect()),
            secret_name: Some(secret.to_owned()),
        });
        ingress
    }

    pub fn with_annotation(mut ingress: Ingress, key: &str, value: &str) -> Ingress {
        ingress
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value.to_owned());
        ingress
    }

    pub fn service(name: &str, port: i32, node_port: Option<i32>) -> Service {
        Service {
            metadata: meta(Some("default"), name),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("http".to_owned()),
                    port,
                    node_port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: meta(Some("default"), name),
            data: Some(
                data.iter()
                    .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn node(name: &str, internal_ip: &str, labels: &[&str]) -> Node {
        let mut metadata = meta(None, name);
        if !labels.is_empty() {
            metadata.labels = Some(
                labels
                    .iter()
                    .map(|label| (label.to_string(), String::new()))
                    .collect(),
            );
        }
        Node {
            metadata,
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_owned(),
                        address: name.to_owned(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_owned(),
                        address: internal_ip.to_owned(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn store() -> (Store, Arc<RetryQueue<QualifiedName>>) {
        let queue = Arc::new(RetryQueue::new(Default::default()));
        let config = Config {
            ingress_class: CLASS.to_owned(),
            ..Default::default()
        };
        (Store::new(&config, Arc::clone(&queue)), queue)
    }
}
