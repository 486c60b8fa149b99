//! Annotations tuning the generated load balancer.
//!
//! Service annotations shape the upstream and vhost zones built for that
//! service; ingress annotations apply to the load balancer as a whole.

use std::collections::BTreeMap;

use crate::{
    api::{LoadBalancerCreateInput, RealIpHeader, RealIpHeaderName, UpstreamZoneInput, VHostZoneInput},
    config::Config,
    error::{Error, Result},
};

pub const LB_BALANCING_ALGORITHM: &str = "servers.com/load-balancer-balancing-algorithm";
pub const APP_PROTOCOL: &str = "servers.com/app-protocol";
pub const APP_HEALTHCHECK_PATH: &str = "servers.com/app-healthcheck-path";
pub const APP_HEALTHCHECK_DOMAIN: &str = "servers.com/app-healthcheck-domain";
pub const APP_HEALTHCHECK_REQUESTS_METHOD: &str = "servers.com/app-healthcheck-requests-method";
pub const APP_HEALTHCHECK_CHECKS_TO_FAIL: &str = "servers.com/app-healthcheck-checks-to-fail";
pub const APP_HEALTHCHECK_CHECKS_TO_PASS: &str = "servers.com/app-healthcheck-checks-to-pass";
pub const APP_HEALTHCHECK_INTERVAL: &str = "servers.com/app-healthcheck-interval";
pub const APP_HEALTHCHECK_JITTER: &str = "servers.com/app-healthcheck-jitter";
pub const LB_IP_HEADER: &str = "servers.com/load-balancer-ip-header";
pub const LB_IP_SUBNETS: &str = "servers.com/load-balancer-ip-subnets";

pub const LB_STORE_LOGS_REGION_CODE: &str = "servers.com/load-balancer-store-logs-region-code";
pub const LB_GEO_IP_ENABLED: &str = "servers.com/load-balancer-geo-ip-enabled";
pub const LB_MIN_TLS_VERSION: &str = "servers.com/load-balancer-min-tls-version";
pub const LB_CLUSTER_ID: &str = "servers.com/load-balancer-cluster-id";
pub const LB_LOCATION_ID: &str = "servers.com/load-balancer-location-id";

/// Applies per-service annotations to the service's upstream zone.
///
/// Health check counters that do not parse as integers are ignored.
pub fn fill_upstream_zone(zone: &mut UpstreamZoneInput, annotations: &BTreeMap<String, String>) {
    let text = |key: &str| annotations.get(key).cloned();
    let number = |key: &str| annotations.get(key).and_then(|value| value.trim().parse().ok());

    if let Some(method) = text(LB_BALANCING_ALGORITHM) {
        zone.method = Some(method);
    }
    if let Some(path) = text(APP_HEALTHCHECK_PATH) {
        zone.hc_path = Some(path);
    }
    if let Some(domain) = text(APP_HEALTHCHECK_DOMAIN) {
        zone.hc_domain = Some(domain);
    }
    if let Some(method) = text(APP_HEALTHCHECK_REQUESTS_METHOD) {
        zone.hc_method = Some(method);
    }
    if let Some(fails) = number(APP_HEALTHCHECK_CHECKS_TO_FAIL) {
        zone.hc_fails = Some(fails);
    }
    if let Some(passes) = number(APP_HEALTHCHECK_CHECKS_TO_PASS) {
        zone.hc_passes = Some(passes);
    }
    if let Some(interval) = number(APP_HEALTHCHECK_INTERVAL) {
        zone.hc_interval = Some(interval);
    }
    if let Some(jitter) = number(APP_HEALTHCHECK_JITTER) {
        zone.hc_jitter = Some(jitter);
    }
}

/// Applies per-service annotations to the service's vhost zone.
pub fn fill_vhost_zone(zone: &mut VHostZoneInput, annotations: &BTreeMap<String, String>) {
    if annotations
        .get(APP_PROTOCOL)
        .is_some_and(|protocol| protocol.eq_ignore_ascii_case("http2"))
    {
        zone.http2 = true;
    }

    if let Some(header) = annotations.get(LB_IP_HEADER) {
        let networks = annotations
            .get(LB_IP_SUBNETS)
            .map(|subnets| {
                subnets
                    .replace(' ', "")
                    .split(',')
                    .filter(|subnet| !subnet.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        zone.real_ip_header = Some(RealIpHeader {
            name: RealIpHeaderName::parse(header),
            networks,
        });
    }
}

/// Applies ingress-wide annotations to the load balancer spec.
pub fn fill_load_balancer(
    input: &mut LoadBalancerCreateInput,
    annotations: &BTreeMap<String, String>,
    config: &Config,
) -> Result<()> {
    if let Some(code) = annotations.get(LB_STORE_LOGS_REGION_CODE) {
        let region = config.region_id(code).ok_or_else(|| {
            Error::configuration(format!("cloud region with code '{code}' not found"))
        })?;
        input.store_logs = Some(true);
        input.store_logs_region_id = Some(region);
    }

    if let Some(value) = annotations.get(LB_GEO_IP_ENABLED) {
        let enabled = value.trim().parse::<bool>().map_err(|err| {
            Error::configuration(format!("{LB_GEO_IP_ENABLED}: invalid value {value:?}: {err}"))
        })?;
        input.geoip = Some(enabled);
    }

    if let Some(preset) = annotations.get(LB_MIN_TLS_VERSION) {
        for zone in &mut input.upstream_zones {
            zone.tls_preset = Some(preset.clone());
        }
    }

    if let Some(cluster) = annotations.get(LB_CLUSTER_ID).filter(|id| !id.is_empty()) {
        input.cluster_id = Some(cluster.clone());
    }

    if let Some(location) = annotations.get(LB_LOCATION_ID) {
        input.location_id = location.trim().parse().map_err(|err| {
            Error::configuration(format!("{LB_LOCATION_ID}: invalid value {location:?}: {err}"))
        })?;
    }

    Ok(())
}
