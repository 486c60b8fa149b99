//! One reconciliation per ingress key: TLS sync, translation, load balancer
//! sync and a detached status sync, or cleanup when the ingress is gone.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use k8s_openapi::api::{core::v1::Secret, networking::v1::Ingress};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    api::{LoadBalancer, LoadBalancerUpdateInput},
    cache::{QualifiedName, Store},
    cert,
    config::Config,
    error::{Error, Result},
    ingress,
    loadbalancer::{load_balancer_name, LoadBalancerManager},
    poller::StatusPoller,
    status::StatusWriter,
    tls::{CertificateManager, CertificateResource},
};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

type StatusTasks = Arc<Mutex<HashMap<QualifiedName, (u64, CancellationToken)>>>;

pub struct Reconciler {
    config: Config,
    store: Arc<Store>,
    certificates: Arc<dyn CertificateManager>,
    balancers: Arc<dyn LoadBalancerManager>,
    status: Arc<dyn StatusWriter>,
    poller: StatusPoller,
    tasks: TaskTracker,
    status_tasks: StatusTasks,
    next_task: AtomicU64,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        config: &Config,
        store: Arc<Store>,
        certificates: Arc<dyn CertificateManager>,
        balancers: Arc<dyn LoadBalancerManager>,
        status: Arc<dyn StatusWriter>,
    ) -> Self {
        Self {
            config: config.clone(),
            store,
            certificates,
            balancers,
            status,
            poller: StatusPoller::new(config.poll_interval, config.poll_timeout),
            tasks: TaskTracker::new(),
            status_tasks: Arc::default(),
            next_task: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reconciles the ingress stored under `key`.
    ///
    /// A missing or foreign-class ingress is not an error: it triggers a
    /// cleanup of every load balancer no controlled ingress accounts for.
    pub async fn reconcile(&self, key: &QualifiedName) -> Result<()> {
        let ingress = match self.store.get::<Ingress>(key) {
            Ok(ingress) => ingress,
            Err(err) if err.is_not_found() => {
                info!("{key}: ingress no longer exists, cleaning up");
                return self.cleanup().await;
            }
            Err(err) => return Err(err),
        };

        if !self.store.is_controlled(&ingress) {
            info!(
                "{key}: ingress is not of class {}, cleaning up",
                self.config.ingress_class()
            );
            return self.cleanup().await;
        }

        info!("{key}: Sync: syncing TLS certificates");
        let certificates = self.sync_tls(&ingress).await?;

        let input = self.balancers.translate(&ingress, &certificates)?;
        info!(
            "{key}: Translate: {} vhost zone(s), {} upstream zone(s)",
            input.vhost_zones.len(),
            input.upstream_zones.len()
        );

        let balancer = if self.balancers.has_registration(&input.name).await {
            let (balancer, changed) = self
                .balancers
                .update(&LoadBalancerUpdateInput::from(&input))
                .await?;
            if changed {
                info!("{key}: Sync: updated load balancer {}", input.name);
            }
            balancer
        } else {
            let balancer = self.balancers.create(&input).await?;
            info!("{key}: Sync: created load balancer {}", input.name);
            balancer
        };

        self.spawn_status_sync(key.clone(), input.name, balancer);
        info!("{key}: Synced");
        Ok(())
    }

    /// Deletes every registered load balancer that no controlled ingress maps to.
    ///
    /// Keeps going after a failed delete and returns the last error.
    pub async fn cleanup(&self) -> Result<()> {
        let valid: HashSet<String> = self
            .store
            .list::<Ingress>()
            .iter()
            .filter(|ingress| self.store.is_controlled(ingress))
            .map(|ingress| load_balancer_name(ingress))
            .collect();

        let mut result = Ok(());
        for name in self.balancers.list_ids().await {
            if valid.contains(&name) {
                continue;
            }
            info!("Cleanup: deleting load balancer {name}");
            if let Err(err) = self.balancers.delete(&name).await {
                warn!("Cleanup: failed to delete load balancer {name}: {err}");
                result = Err(err);
            }
        }
        result
    }

    /// Cancels pending status syncs and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Waits for the status syncs spawned so far.
    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Resolves the certificate of every TLS host, keyed by host.
    ///
    /// Per-host override annotations win over `spec.tls`.
    async fn sync_tls(&self, ingress: &Ingress) -> Result<BTreeMap<String, String>> {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
        let mut resolved = HashMap::<String, String>::new();
        let mut hosts = BTreeMap::new();

        for tls in ingress::tls_bindings(ingress) {
            let Some(reference) = tls.secret_name.as_deref().filter(|name| !name.is_empty())
            else {
                continue;
            };
            let id = self
                .resolve_certificate(namespace, reference, &mut resolved)
                .await?;
            for host in tls.hosts.iter().flatten() {
                hosts.insert(host.clone(), id.clone());
            }
        }

        let overrides: Vec<_> = ingress::certificate_overrides(ingress).collect();
        for (host, reference) in overrides {
            let id = self
                .resolve_certificate(namespace, reference, &mut resolved)
                .await?;
            hosts.insert(host.to_owned(), id);
        }

        Ok(hosts)
    }

    async fn resolve_certificate(
        &self,
        namespace: &str,
        reference: &str,
        resolved: &mut HashMap<String, String>,
    ) -> Result<String> {
        if let Some(id) = resolved.get(reference) {
            return Ok(id.clone());
        }

        let prefix = self.config.cert_manager_prefix.as_str();
        let external_id = reference
            .strip_prefix(prefix)
            .filter(|_| !prefix.is_empty());
        let resource = match external_id {
            Some(id) => self.certificates.get_by_id(id).await?,
            None => self.sync_secret(namespace, reference).await?,
        };

        resolved.insert(reference.to_owned(), resource.remote_id.clone());
        Ok(resource.remote_id)
    }

    async fn sync_secret(&self, namespace: &str, name: &str) -> Result<CertificateResource> {
        let key = QualifiedName::new(namespace, name);
        let secret = self.store.get::<Secret>(&key)?;

        let certificate = secret_field(&secret, &key, TLS_CERT_KEY)?;
        let private_key = secret_field(&secret, &key, TLS_PRIVATE_KEY_KEY)?;

        cert::validate_certificate(certificate).map_err(|err| match err {
            Error::Validation(msg) => Error::validation(format!("secret {key}: {msg}")),
            other => other,
        })?;
        let (leaf, chain) = cert::split_certs(certificate)
            .ok_or_else(|| Error::validation(format!("secret {key}: no certificate found")))?;
        let fingerprint = cert::fingerprint(leaf.as_bytes()).ok_or_else(|| {
            Error::validation(format!("secret {key}: can't fingerprint certificate"))
        })?;

        if self.certificates.has_registration(&fingerprint).await {
            debug!("Certificate {fingerprint} from {key} is already registered");
            return self.certificates.get(&fingerprint).await;
        }
        info!("Sync: uploading certificate {fingerprint} from secret {key}");
        self.certificates
            .sync_certificate(
                &fingerprint,
                &key.to_string(),
                &leaf,
                &cert::strip_spaces(private_key),
                chain.as_deref(),
            )
            .await
    }

    /// Publishes the load balancer addresses once it is ready, replacing any
    /// status sync still running for the same key.
    fn spawn_status_sync(&self, key: QualifiedName, name: String, balancer: LoadBalancer) {
        let cancel = self.shutdown.child_token();
        let generation = self.next_task.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self
            .status_tasks
            .lock()
            .insert(key.clone(), (generation, cancel.clone()))
        {
            previous.cancel();
        }

        let balancers = Arc::clone(&self.balancers);
        let status = Arc::clone(&self.status);
        let status_tasks = Arc::clone(&self.status_tasks);
        let poller = self.poller;
        self.tasks.spawn(async move {
            sync_status(
                &key,
                &name,
                balancer,
                poller,
                &cancel,
                balancers.as_ref(),
                status.as_ref(),
            )
            .await;

            let mut tasks = status_tasks.lock();
            if tasks
                .get(&key)
                .is_some_and(|(current, _)| *current == generation)
            {
                tasks.remove(&key);
            }
        });
    }
}

fn secret_field<'a>(secret: &'a Secret, key: &QualifiedName, field: &str) -> Result<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(field))
        .map(|value| value.0.as_slice())
        .ok_or_else(|| Error::validation(format!("secret {key} has no {field} field")))
}

async fn sync_status(
    key: &QualifiedName,
    name: &str,
    balancer: LoadBalancer,
    poller: StatusPoller,
    cancel: &CancellationToken,
    balancers: &dyn LoadBalancerManager,
    status: &dyn StatusWriter,
) {
    let ready = if balancer.is_active() {
        Ok(balancer)
    } else {
        info!("{key}: SyncStatus: waiting for load balancer {name}");
        poller
            .wait(cancel, || balancers.get(name), LoadBalancer::is_active)
            .await
    };

    let balancer = match ready {
        Ok(balancer) => balancer,
        Err(Error::Cancelled) => {
            debug!("{key}: SyncStatus: cancelled");
            return;
        }
        Err(err) => {
            warn!("{key}: SyncStatus: load balancer {name} not ready: {err}");
            return;
        }
    };

    match status.write(key, &balancer.external_addresses).await {
        Ok(()) => info!(
            "{key}: UpdateStatus: published {}",
            balancer.external_addresses.join(", ")
        ),
        Err(err) => warn!("{key}: UpdateStatus: {err}"),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::{
        api::memory::MemoryApi, cache::fixtures, loadbalancer::LoadBalancerRegistry,
        queue::RetryQueue, status::RecordingStatusWriter, tls::TlsRegistry,
    };

    pub struct Harness {
        pub store: Arc<Store>,
        pub queue: Arc<RetryQueue<QualifiedName>>,
        pub api: Arc<MemoryApi>,
        pub status: Arc<RecordingStatusWriter>,
        pub reconciler: Arc<Reconciler>,
    }

    pub fn harness() -> Harness {
        harness_with(MemoryApi::new(), Config::default())
    }

    pub fn harness_with(api: MemoryApi, config: Config) -> Harness {
        harness_on(Arc::new(api), config)
    }

    /// A fresh store and registries talking to `api`.
    pub fn harness_on(api: Arc<MemoryApi>, config: Config) -> Harness {
        let config = Config {
            ingress_class: fixtures::CLASS.to_owned(),
            ..config
        };
        let queue = Arc::new(RetryQueue::new(config.backoff()));
        let store = Arc::new(Store::new(&config, Arc::clone(&queue)));
        let status = Arc::new(RecordingStatusWriter::default());
        let reconciler = Arc::new(Reconciler::new(
            &config,
            Arc::clone(&store),
            Arc::new(TlsRegistry::new(api.clone())),
            Arc::new(LoadBalancerRegistry::new(
                api.clone(),
                Arc::clone(&store),
                &config,
            )),
            status.clone(),
        ));
        Harness {
            store,
            queue,
            api,
            status,
            reconciler,
        }
    }
}
