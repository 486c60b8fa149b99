use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;

use crate::{
    annotations,
    api::{
        LoadBalancerCreateInput, LocationZoneInput, UpstreamInput, UpstreamZoneInput,
        VHostZoneInput,
    },
    cache::{QualifiedName, Store},
    config::Config,
    error::{Error, Result},
};

const NAME_PREFIX: &str = "ingress-";
const NAME_IDENTITY_LEN: usize = 32;

const HTTP_PORT: i32 = 80;
const HTTPS_PORT: i32 = 443;

/// Remote name of the load balancer owned by `ingress`, derived from its uid.
pub fn load_balancer_name(ingress: &Ingress) -> String {
    let uid = ingress.metadata.uid.as_deref().unwrap_or_default();
    let identity: String = std::iter::once('a')
        .chain(uid.chars().filter(|c| *c != '-'))
        .take(NAME_IDENTITY_LEN)
        .collect();
    format!("{NAME_PREFIX}{identity}")
}

pub fn upstream_zone_id(service: &str) -> String {
    format!("upstream-zone-{service}")
}

pub fn vhost_zone_id(service: &str) -> String {
    format!("vhost-zone-{service}")
}

/// Builds the load balancer for `ingress`: one upstream zone and one vhost zone per backing service.
///
/// `certificates` maps hosts to remote certificate ids; a vhost zone serves
/// TLS on 443 when any of its hosts has one.
pub(super) fn translate(
    store: &Store,
    config: &Config,
    ingress: &Ingress,
    certificates: &BTreeMap<String, String>,
) -> Result<LoadBalancerCreateInput> {
    let services = store.service_endpoint_info(ingress)?;

    let mut upstream_zones = Vec::with_capacity(services.len());
    let mut vhost_zones = Vec::with_capacity(services.len());
    for (service, info) in &services {
        let upstream_id = upstream_zone_id(service);

        let mut upstream = UpstreamZoneInput {
            id: upstream_id.clone(),
            upstreams: info
                .node_ips
                .iter()
                .map(|ip| UpstreamInput {
                    ip: ip.clone(),
                    port: info.node_port,
                    weight: 1,
                })
                .collect(),
            ..Default::default()
        };
        annotations::fill_upstream_zone(&mut upstream, &info.annotations);

        let ssl_cert_id = info
            .hosts
            .iter()
            .find_map(|host| certificates.get(host))
            .cloned();
        let mut vhost = VHostZoneInput {
            id: vhost_zone_id(service),
            domains: info.hosts.clone(),
            ssl: ssl_cert_id.is_some(),
            ports: vec![if ssl_cert_id.is_some() {
                HTTPS_PORT
            } else {
                HTTP_PORT
            }],
            ssl_cert_id,
            location_zones: vec![LocationZoneInput {
                location: "/".to_owned(),
                upstream_id,
            }],
            ..Default::default()
        };
        annotations::fill_vhost_zone(&mut vhost, &info.annotations);

        upstream_zones.push(upstream);
        vhost_zones.push(vhost);
    }

    if upstream_zones.is_empty() || vhost_zones.is_empty() {
        return Err(Error::configuration(format!(
            "ingress {} has no valid backends",
            QualifiedName::from_resource(ingress)
        )));
    }

    let mut input = LoadBalancerCreateInput {
        name: load_balancer_name(ingress),
        location_id: config.location_id,
        vhost_zones,
        upstream_zones,
        ..Default::default()
    };
    annotations::fill_load_balancer(
        &mut input,
        ingress.metadata.annotations.as_ref().unwrap_or(&BTreeMap::new()),
        config,
    )?;

    Ok(input)
}
