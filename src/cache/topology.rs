use std::collections::BTreeMap;

use k8s_openapi::api::{
    core::v1::{Node, Service},
    networking::v1::{Ingress, ServiceBackendPort},
};

use super::{QualifiedName, Store};
use crate::error::{Error, Result};

/// Labels marking control plane nodes, which never receive load balancer traffic.
pub const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

const INTERNAL_IP: &str = "InternalIP";

/// What one backing service of an ingress contributes to its load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpointInfo {
    /// Hosts routed to the service, in first-seen order.
    pub hosts: Vec<String>,
    /// Internal IPs of the worker nodes, sorted.
    pub node_ips: Vec<String>,
    pub node_port: i32,
    pub annotations: BTreeMap<String, String>,
}

/// The first internal IP of a worker node, or `None` for control plane nodes.
pub fn routable_address(node: &Node) -> Option<String> {
    let is_control_plane = node
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| CONTROL_PLANE_LABELS.iter().any(|label| labels.contains_key(*label)));
    if is_control_plane {
        return None;
    }

    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|address| address.type_ == INTERNAL_IP)
        .map(|address| address.address.clone())
}

impl Store {
    /// Internal IPs of every worker node.
    pub fn node_ips(&self) -> Vec<String> {
        let mut ips: Vec<_> = self
            .list::<Node>()
            .iter()
            .filter_map(|node| routable_address(node))
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// Resolves every service backend of the ingress to its node port and hosts, keyed by service name.
    ///
    /// Only node port backends are supported: a matched service port without a
    /// node port fails the whole ingress.
    pub fn service_endpoint_info(
        &self,
        ingress: &Ingress,
    ) -> Result<BTreeMap<String, ServiceEndpointInfo>> {
        let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
        let node_ips = self.node_ips();
        let mut info = BTreeMap::<String, ServiceEndpointInfo>::new();

        let rules = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_deref())
            .unwrap_or_default();
        for rule in rules {
            let Some(http) = &rule.http else {
                continue;
            };
            let host = rule.host.as_deref().filter(|host| !host.is_empty());

            for path in &http.paths {
                let backend = path.backend.service.as_ref().ok_or_else(|| {
                    Error::configuration(format!(
                        "ingress {}: path {:?} has no service backend",
                        QualifiedName::from_resource(ingress),
                        path.path.as_deref().unwrap_or("/"),
                    ))
                })?;

                let key = QualifiedName::new(&namespace, &backend.name);
                let service = self.get::<Service>(&key).map_err(|err| {
                    Error::configuration(format!("error getting service: {err}"))
                })?;
                let node_port = resolve_node_port(&service, backend.port.as_ref())?;

                let entry = info
                    .entry(backend.name.clone())
                    .or_insert_with(|| ServiceEndpointInfo {
                        hosts: Vec::new(),
                        node_ips: node_ips.clone(),
                        node_port,
                        annotations: service.metadata.annotations.clone().unwrap_or_default(),
                    });
                if entry.node_port != node_port {
                    return Err(Error::configuration(format!(
                        "service {} is referenced through node ports {} and {}",
                        backend.name, entry.node_port, node_port
                    )));
                }
                if let Some(host) = host {
                    if !entry.hosts.iter().any(|known| known == host) {
                        entry.hosts.push(host.to_owned());
                    }
                }
            }
        }

        Ok(info)
    }
}

fn resolve_node_port(service: &Service, port: Option<&ServiceBackendPort>) -> Result<i32> {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let wanted = match port {
        Some(ServiceBackendPort {
            number: Some(number),
            ..
        }) => PortRef::Number(*number),
        Some(ServiceBackendPort {
            name: Some(port_name),
            ..
        }) => PortRef::Name(port_name.as_str()),
        _ => {
            return Err(Error::configuration(format!(
                "ingress backend for service {name} declares no port"
            )))
        }
    };

    let matched = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default()
        .iter()
        .find(|candidate| match wanted {
            PortRef::Number(number) => candidate.port == number,
            PortRef::Name(port_name) => candidate.name.as_deref() == Some(port_name),
        })
        .ok_or_else(|| Error::configuration(format!("service {name}: port {wanted} not found")))?;

    match matched.node_port {
        Some(node_port) if node_port != 0 => Ok(node_port),
        _ => Err(Error::configuration(format!(
            "service {name} has no NodePort (only NodePort/LoadBalancer supported)"
        ))),
    }
}

#[derive(Clone, Copy)]
enum PortRef<'a> {
    Number(i32),
    Name(&'a str),
}

impl std::fmt::Display for PortRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        core::v1::ServicePort,
        networking::v1::{HTTPIngressRuleValue, IngressBackend, IngressRule},
    };

    use super::super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn node_ips_skip_control_plane() {
        let (store, _queue) = store();
        store.apply(node("master", "192.168.1.1", &["node-role.kubernetes.io/master"]));
        store.apply(node("cp", "192.168.1.4", &["node-role.kubernetes.io/control-plane"]));
        store.apply(node("node2", "192.168.1.3", &[]));
        store.apply(node("node1", "192.168.1.2", &[]));

        assert_eq!(store.node_ips(), ["192.168.1.2", "192.168.1.3"]);
    }

    #[tokio::test]
    async fn aggregates_hosts_per_service() {
        let (store, _queue) = store();
        store.apply(node("node1", "192.168.1.1", &[]));
        let mut svc = service("test-service", 80, Some(30000));
        svc.metadata.annotations = Some([("key".to_owned(), "value".to_owned())].into());
        store.apply(svc);

        let mut ing = ingress("test-ingress", "example.com", "test-service", 80);
        let rules = ing.spec.as_mut().unwrap().rules.as_mut().unwrap();
        rules.push(IngressRule {
            host: Some("www.example.com".to_owned()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![path("/", "test-service", 80), path("/api", "test-service", 80)],
            }),
        });
        rules.push(IngressRule {
            host: Some("example.com".to_owned()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![path("/other", "test-service", 80)],
            }),
        });

        let info = store.service_endpoint_info(&ing).unwrap();
        assert_eq!(info.len(), 1);
        let svc = &info["test-service"];
        assert_eq!(svc.hosts, ["example.com", "www.example.com"]);
        assert_eq!(svc.node_port, 30000);
        assert_eq!(svc.node_ips, ["192.168.1.1"]);
        assert_eq!(svc.annotations.get("key").map(String::as_str), Some("value"));
    }

    #[tokio::test]
    async fn matches_named_ports() {
        let (store, _queue) = store();
        store.apply(service("web", 80, Some(30080)));

        let mut ing = ingress("test-ingress", "example.com", "web", 80);
        let path = &mut ing.spec.as_mut().unwrap().rules.as_mut().unwrap()[0]
            .http
            .as_mut()
            .unwrap()
            .paths[0];
        path.backend.service.as_mut().unwrap().port = Some(ServiceBackendPort {
            name: Some("http".to_owned()),
            number: None,
        });

        let info = store.service_endpoint_info(&ing).unwrap();
        assert_eq!(info["web"].node_port, 30080);
    }

    #[tokio::test]
    async fn missing_node_port_is_an_error() {
        let (store, _queue) = store();
        store.apply(service("web", 80, None));

        let err = store
            .service_endpoint_info(&ingress("test-ingress", "example.com", "web", 80))
            .unwrap_err();
        assert!(matches!(&err, Error::Configuration(msg) if msg.contains("has no NodePort")));

        store.apply(service("web", 80, Some(0)));
        let err = store
            .service_endpoint_info(&ingress("test-ingress", "example.com", "web", 80))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn unknown_service_or_port_is_an_error() {
        let (store, _queue) = store();
        let err = store
            .service_endpoint_info(&ingress("test-ingress", "example.com", "web", 80))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        store.apply(service("web", 8080, Some(30000)));
        let err = store
            .service_endpoint_info(&ingress("test-ingress", "example.com", "web", 80))
            .unwrap_err();
        assert!(err.to_string().contains("port 80 not found"));
    }

    #[tokio::test]
    async fn conflicting_node_ports_are_rejected() {
        let (store, _queue) = store();
        let mut svc = service("web", 80, Some(30000));
        svc.spec.as_mut().unwrap().ports.as_mut().unwrap().push(
            ServicePort {
                name: Some("admin".to_owned()),
                port: 8080,
                node_port: Some(30001),
                ..Default::default()
            },
        );
        store.apply(svc);

        let mut ing = ingress("test-ingress", "example.com", "web", 80);
        ing.spec.as_mut().unwrap().rules.as_mut().unwrap()[0]
            .http
            .as_mut()
            .unwrap()
            .paths
            .push(path("/admin", "web", 8080));

        let err = store.service_endpoint_info(&ing).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn rules_without_http_or_host() {
        let (store, _queue) = store();
        store.apply(service("web", 80, Some(30000)));

        let mut ing = ingress("test-ingress", "example.com", "web", 80);
        let rules = ing.spec.as_mut().unwrap().rules.as_mut().unwrap();
        rules.push(IngressRule {
            host: Some("ignored.example.com".to_owned()),
            http: None,
        });
        rules.push(IngressRule {
            host: None,
            http: Some(HTTPIngressRuleValue {
                paths: vec![path("/", "web", 80)],
            }),
        });

        let info = store.service_endpoint_info(&ing).unwrap();
        assert_eq!(info["web"].hosts, ["example.com"]);
    }

    #[tokio::test]
    async fn non_service_backend_is_an_error() {
        let (store, _queue) = store();
        let mut ing = ingress("test-ingress", "example.com", "web", 80);
        ing.spec.as_mut().unwrap().rules.as_mut().unwrap()[0]
            .http
            .as_mut()
            .unwrap()
            .paths[0]
            .backend = IngressBackend::default();

        let err = store.service_endpoint_info(&ing).unwrap_err();
        assert!(err.to_string().contains("has no service backend"));
    }
}
