use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ApiError, CertificateApi, CustomCertificateInput, LoadBalancer, LoadBalancerApi,
    LoadBalancerCreateInput, LoadBalancerUpdateInput, SslCertificate, ACTIVE_STATUS,
};
use crate::cert;

/// Remote operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Search,
    Create,
    Update,
    Delete,
    Get,
    CertSearch,
    CertCreate,
    CertGet,
}

/// Number of calls received per operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    pub search: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub get: usize,
    pub cert_search: usize,
    pub cert_create: usize,
    pub cert_get: usize,
}

impl Calls {
    /// Calls that change remote state.
    pub fn mutations(&self) -> usize {
        self.create + self.update + self.delete + self.cert_create
    }
}

/// In-process implementation of both remote APIs.
///
/// Load balancers are created with a configurable status and external
/// addresses; certificates are indexed by the fingerprint of their public key.
pub struct MemoryApi {
    state: Mutex<State>,
}

struct State {
    balancers: BTreeMap<String, LoadBalancer>,
    applied: BTreeMap<String, LoadBalancerUpdateInput>,
    certificates: BTreeMap<String, SslCertificate>,
    calls: Calls,
    failing: HashSet<Op>,
    next_id: u64,
    initial_status: String,
    addresses: Vec<String>,
}

impl Default for MemoryApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                balancers: BTreeMap::new(),
                applied: BTreeMap::new(),
                certificates: BTreeMap::new(),
                calls: Calls::default(),
                failing: HashSet::new(),
                next_id: 0,
                initial_status: ACTIVE_STATUS.to_owned(),
                addresses: vec!["203.0.113.10".to_owned()],
            }),
        }
    }

    /// Status assigned to newly created load balancers.
    pub fn with_initial_status(self, status: &str) -> Self {
        self.state.lock().initial_status = status.to_owned();
        self
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls.clone()
    }

    /// Makes every following call of `op` fail until [`recover`](Self::recover) is called.
    pub fn fail(&self, op: Op) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: Op) {
        self.state.lock().failing.remove(&op);
    }

    pub fn set_status(&self, id: &str, status: &str) {
        if let Some(balancer) = self.state.lock().balancers.get_mut(id) {
            balancer.status = status.to_owned();
        }
    }

    pub fn balancers(&self) -> Vec<LoadBalancer> {
        self.state.lock().balancers.values().cloned().collect()
    }

    pub fn balancer_by_name(&self, name: &str) -> Option<LoadBalancer> {
        self.state
            .lock()
            .balancers
            .values()
            .find(|balancer| balancer.name == name)
            .cloned()
    }

    /// The spec a load balancer currently runs, in update form.
    pub fn applied_spec(&self, id: &str) -> Option<LoadBalancerUpdateInput> {
        self.state.lock().applied.get(id).cloned()
    }

    pub fn certificates(&self) -> Vec<SslCertificate> {
        self.state.lock().certificates.values().cloned().collect()
    }

    /// Seeds a load balancer that exists remotely but is unknown to any registry.
    pub fn insert_balancer(&self, balancer: LoadBalancer) {
        self.state
            .lock()
            .balancers
            .insert(balancer.id.clone(), balancer);
    }

    pub fn insert_certificate(&self, certificate: SslCertificate) {
        self.state
            .lock()
            .certificates
            .insert(certificate.id.clone(), certificate);
    }
}

impl State {
    fn check(&self, op: Op) -> Result<(), ApiError> {
        if self.failing.contains(&op) {
            return Err(ApiError::Request(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[async_trait]
impl LoadBalancerApi for MemoryApi {
    async fn search(
        &self,
        pattern: &str,
        location_id: Option<i64>,
    ) -> Result<Vec<LoadBalancer>, ApiError> {
        let mut state = self.state.lock();
        state.calls.search += 1;
        state.check(Op::Search)?;
        Ok(state
            .balancers
            .values()
            .filter(|balancer| balancer.name.contains(pattern))
            .filter(|balancer| location_id.map_or(true, |id| balancer.location_id == id))
            .cloned()
            .collect())
    }

    async fn create(&self, input: &LoadBalancerCreateInput) -> Result<LoadBalancer, ApiError> {
        let mut state = self.state.lock();
        state.calls.create += 1;
        state.check(Op::Create)?;
        let balancer = LoadBalancer {
            id: state.next_id("lb"),
            name: input.name.clone(),
            status: state.initial_status.clone(),
            external_addresses: state.addresses.clone(),
            location_id: input.location_id,
            cluster_id: input.cluster_id.clone(),
        };
        state
            .applied
            .insert(balancer.id.clone(), LoadBalancerUpdateInput::from(input));
        state
            .balancers
            .insert(balancer.id.clone(), balancer.clone());
        Ok(balancer)
    }

    async fn update(
        &self,
        id: &str,
        input: &LoadBalancerUpdateInput,
    ) -> Result<LoadBalancer, ApiError> {
        let mut state = self.state.lock();
        state.calls.update += 1;
        state.check(Op::Update)?;
        let balancer = state
            .balancers
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(id.to_owned()))?;
        balancer.name = input.name.clone();
        balancer.cluster_id = input.cluster_id.clone();
        let balancer = balancer.clone();
        state.applied.insert(id.to_owned(), input.clone());
        Ok(balancer)
    }

    async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.delete += 1;
        state.check(Op::Delete)?;
        state.applied.remove(id);
        state
            .balancers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(id.to_owned()))
    }

    async fn get(&self, id: &str) -> Result<LoadBalancer, ApiError> {
        let mut state = self.state.lock();
        state.calls.get += 1;
        state.check(Op::Get)?;
        state
            .balancers
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_owned()))
    }
}

#[async_trait]
impl CertificateApi for MemoryApi {
    async fn search(&self, fingerprint: &str) -> Result<Vec<SslCertificate>, ApiError> {
        let mut state = self.state.lock();
        state.calls.cert_search += 1;
        state.check(Op::CertSearch)?;
        Ok(state
            .certificates
            .values()
            .filter(|certificate| {
                certificate
                    .sha1_fingerprint
                    .to_ascii_lowercase()
                    .contains(&fingerprint.to_ascii_lowercase())
            })
            .cloned()
            .collect())
    }

    async fn create_custom(
        &self,
        input: &CustomCertificateInput,
    ) -> Result<SslCertificate, ApiError> {
        let mut state = self.state.lock();
        state.calls.cert_create += 1;
        state.check(Op::CertCreate)?;
        let sha1_fingerprint = cert::fingerprint(input.public_key.as_bytes())
            .ok_or_else(|| ApiError::Request("public key is not a certificate".to_owned()))?;
        let certificate = SslCertificate {
            id: state.next_id("cert"),
            name: input.name.clone(),
            sha1_fingerprint,
        };
        state
            .certificates
            .insert(certificate.id.clone(), certificate.clone());
        Ok(certificate)
    }

    async fn get_custom(&self, id: &str) -> Result<SslCertificate, ApiError> {
        let mut state = self.state.lock();
        state.calls.cert_get += 1;
        state.check(Op::CertGet)?;
        state
            .certificates
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_owned()))
    }
}
