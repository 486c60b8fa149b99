//! Registry of remote L7 load balancers, keyed by their derived name.
//!
//! Every mutation goes through the registry lock, remote call included, so the
//! registered spec never diverges from what was last applied remotely.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::networking::v1::Ingress;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    api::{
        ApiError, LoadBalancer, LoadBalancerApi, LoadBalancerCreateInput, LoadBalancerUpdateInput,
    },
    cache::Store,
    config::Config,
    error::{Error, Result},
};

mod translate;
pub use translate::{load_balancer_name, upstream_zone_id, vhost_zone_id};

/// A registered load balancer with the spec last applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerResource {
    pub remote: LoadBalancer,
    pub applied: LoadBalancerUpdateInput,
    /// Set once a delete was issued; cleared only by removing the entry.
    pub deleted: bool,
    pub last_refresh: DateTime<Utc>,
}

#[async_trait]
pub trait LoadBalancerManager: Send + Sync {
    async fn has_registration(&self, name: &str) -> bool;

    /// Creates the load balancer, or adopts and updates one with the same name in the same location.
    async fn create(&self, input: &LoadBalancerCreateInput) -> Result<LoadBalancer>;

    /// Applies `input` to the registered load balancer of the same name.
    ///
    /// Returns `false` without contacting the remote API when the load balancer
    /// is being deleted or already runs an identical spec.
    async fn update(&self, input: &LoadBalancerUpdateInput) -> Result<(LoadBalancer, bool)>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Refreshes the remote state of a registered load balancer.
    async fn get(&self, name: &str) -> Result<LoadBalancer>;

    async fn list_ids(&self) -> Vec<String>;

    /// Builds the load balancer spec for `ingress` given the resolved host to certificate id bindings.
    fn translate(
        &self,
        ingress: &Ingress,
        certificates: &BTreeMap<String, String>,
    ) -> Result<LoadBalancerCreateInput>;
}

pub struct LoadBalancerRegistry {
    balancers: Mutex<HashMap<String, LoadBalancerResource>>,
    api: Arc<dyn LoadBalancerApi>,
    store: Arc<Store>,
    config: Config,
}

impl LoadBalancerRegistry {
    pub fn new(api: Arc<dyn LoadBalancerApi>, store: Arc<Store>, config: &Config) -> Self {
        Self {
            balancers: Mutex::new(HashMap::new()),
            api,
            store,
            config: config.clone(),
        }
    }
}

/// Compares specs by their canonical JSON form.
fn same_spec<T: Serialize>(left: &T, right: &T) -> bool {
    match (serde_json::to_vec(left), serde_json::to_vec(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

fn not_registered(name: &str) -> Error {
    Error::NotFound(format!("load balancer {name}"))
}

#[async_trait]
impl LoadBalancerManager for LoadBalancerRegistry {
    async fn has_registration(&self, name: &str) -> bool {
        self.balancers.lock().await.contains_key(name)
    }

    async fn create(&self, input: &LoadBalancerCreateInput) -> Result<LoadBalancer> {
        let mut balancers = self.balancers.lock().await;

        let existing = self
            .api
            .search(&input.name, Some(input.location_id))
            .await?
            .into_iter()
            .find(|remote| remote.name == input.name);

        let applied = LoadBalancerUpdateInput::from(input);
        let remote = match existing {
            Some(remote) => {
                info!("Load balancer {} already exists as {}, updating", input.name, remote.id);
                self.api.update(&remote.id, &applied).await?
            }
            None => {
                info!("Creating load balancer {}", input.name);
                self.api.create(input).await?
            }
        };

        balancers.insert(
            input.name.clone(),
            LoadBalancerResource {
                remote: remote.clone(),
                applied,
                deleted: false,
                last_refresh: Utc::now(),
            },
        );
        Ok(remote)
    }

    async fn update(&self, input: &LoadBalancerUpdateInput) -> Result<(LoadBalancer, bool)> {
        let mut balancers = self.balancers.lock().await;
        let entry = balancers
            .get_mut(&input.name)
            .ok_or_else(|| not_registered(&input.name))?;

        if entry.deleted {
            warn!(
                "Load balancer {} still awaits deletion after a failed delete, not applying changes",
                input.name
            );
            return Ok((entry.remote.clone(), false));
        }
        if same_spec(&entry.applied, input) {
            debug!("Load balancer {} is up to date", input.name);
            return Ok((entry.remote.clone(), false));
        }

        let snapshot = entry.clone();
        entry.applied = input.clone();
        let id = entry.remote.id.clone();
        match self.api.update(&id, input).await {
            Ok(remote) => {
                info!("Updated load balancer {}", input.name);
                entry.remote = remote.clone();
                entry.last_refresh = Utc::now();
                Ok((remote, true))
            }
            Err(err) => {
                *entry = snapshot;
                Err(err.into())
            }
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut balancers = self.balancers.lock().await;
        let entry = balancers.get_mut(name).ok_or_else(|| not_registered(name))?;
        entry.deleted = true;
        let id = entry.remote.id.clone();

        match self.api.delete(&id).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {
                info!("Deleted load balancer {name}");
                balancers.remove(name);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, name: &str) -> Result<LoadBalancer> {
        let mut balancers = self.balancers.lock().await;
        let entry = balancers.get_mut(name).ok_or_else(|| not_registered(name))?;

        let id = entry.remote.id.clone();
        let remote = self.api.get(&id).await?;
        entry.remote = remote.clone();
        entry.last_refresh = Utc::now();
        Ok(remote)
    }

    async fn list_ids(&self) -> Vec<String> {
        let mut names: Vec<_> = self.balancers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn translate(
        &self,
        ingress: &Ingress,
        certificates: &BTreeMap<String, String>,
    ) -> Result<LoadBalancerCreateInput> {
        translate::translate(&self.store, &self.config, ingress, certificates)
    }
}
