//! Request/response contract of the remote load balancer and certificate API.
//!
//! The transport is provided by the embedder through [`LoadBalancerApi`] and
//! [`CertificateApi`]. [`memory::MemoryApi`] implements both in-process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

/// Status reported by the remote API once a load balancer serves traffic.
pub const ACTIVE_STATUS: &str = "active";

/// Errors returned by remote collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("resource {0:?} not found")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// A load balancer as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub name: String,
    pub status: String,
    pub external_addresses: Vec<String>,
    pub location_id: i64,
    pub cluster_id: Option<String>,
}

impl LoadBalancer {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case(ACTIVE_STATUS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamInput {
    pub ip: String,
    pub port: i32,
    pub weight: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamZoneInput {
    pub id: String,
    pub upstreams: Vec<UpstreamInput>,
    pub method: Option<String>,
    pub hc_path: Option<String>,
    pub hc_domain: Option<String>,
    pub hc_method: Option<String>,
    pub hc_fails: Option<i32>,
    pub hc_passes: Option<i32>,
    pub hc_interval: Option<i32>,
    pub hc_jitter: Option<i32>,
    pub tls_preset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealIpHeaderName {
    RealIp,
    ForwardedFor,
}

impl RealIpHeaderName {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "real_ip" => Some(Self::RealIp),
            "forwarded_for" => Some(Self::ForwardedFor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealIpHeader {
    pub name: Option<RealIpHeaderName>,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationZoneInput {
    pub location: String,
    pub upstream_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VHostZoneInput {
    pub id: String,
    pub domains: Vec<String>,
    pub ssl: bool,
    pub ssl_cert_id: Option<String>,
    pub ports: Vec<i32>,
    pub http2: bool,
    pub real_ip_header: Option<RealIpHeader>,
    pub location_zones: Vec<LocationZoneInput>,
}

/// Specification sent when creating a load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerCreateInput {
    pub name: String,
    pub location_id: i64,
    pub cluster_id: Option<String>,
    pub store_logs: Option<bool>,
    pub store_logs_region_id: Option<i64>,
    pub geoip: Option<bool>,
    pub vhost_zones: Vec<VHostZoneInput>,
    pub upstream_zones: Vec<UpstreamZoneInput>,
}

/// Specification sent when updating an existing load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerUpdateInput {
    pub name: String,
    pub cluster_id: Option<String>,
    pub shared_cluster: Option<bool>,
    pub store_logs: Option<bool>,
    pub store_logs_region_id: Option<i64>,
    pub geoip: Option<bool>,
    pub vhost_zones: Vec<VHostZoneInput>,
    pub upstream_zones: Vec<UpstreamZoneInput>,
}

impl From<&LoadBalancerCreateInput> for LoadBalancerUpdateInput {
    fn from(input: &LoadBalancerCreateInput) -> Self {
        Self {
            name: input.name.clone(),
            shared_cluster: input.cluster_id.is_none().then_some(true),
            cluster_id: input.cluster_id.clone(),
            store_logs: input.store_logs,
            store_logs_region_id: input.store_logs_region_id,
            geoip: input.geoip,
            vhost_zones: input.vhost_zones.clone(),
            upstream_zones: input.upstream_zones.clone(),
        }
    }
}

/// A TLS certificate as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslCertificate {
    pub id: String,
    pub name: String,
    pub sha1_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCertificateInput {
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    pub chain_key: Option<String>,
}

/// Remote operations on L7 load balancers.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Lists L7 load balancers whose name matches `pattern`, optionally within one location.
    async fn search(
        &self,
        pattern: &str,
        location_id: Option<i64>,
    ) -> Result<Vec<LoadBalancer>, ApiError>;

    async fn create(&self, input: &LoadBalancerCreateInput) -> Result<LoadBalancer, ApiError>;

    async fn update(
        &self,
        id: &str,
        input: &LoadBalancerUpdateInput,
    ) -> Result<LoadBalancer, ApiError>;

    async fn delete(&self, id: &str) -> Result<(), ApiError>;

    async fn get(&self, id: &str) -> Result<LoadBalancer, ApiError>;
}

/// Remote operations on custom TLS certificates.
#[async_trait]
pub trait CertificateApi: Send + Sync {
    /// Lists custom certificates matching a fingerprint pattern.
    async fn search(&self, fingerprint: &str) -> Result<Vec<SslCertificate>, ApiError>;

    async fn create_custom(&self, input: &CustomCertificateInput)
        -> Result<SslCertificate, ApiError>;

    async fn get_custom(&self, id: &str) -> Result<SslCertificate, ApiError>;
}
