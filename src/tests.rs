use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;

use crate::{
    api::{UpstreamInput, UpstreamZoneInput, VHostZoneInput},
    cache::fixtures::*,
    cert::testdata::*,
    config::Config,
    error::Error,
    ingress::INGRESS_CLASS_ANNOTATION,
    loadbalancer::load_balancer_name,
    reconciler::{
        fixtures::{harness, harness_on, Harness},
        TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
    },
    QualifiedName,
};

fn key() -> QualifiedName {
    QualifiedName::new("default", "test-ingress")
}

fn cluster(h: &Harness) {
    h.store.apply(node("master", "192.168.1.100", &["node-role.kubernetes.io/master"]));
    h.store.apply(node("node1", "192.168.1.1", &[]));
    h.store.apply(node("node2", "192.168.1.2", &[]));
    h.store.apply(service("test-service", 80, Some(30000)));
}

fn applied_zones(h: &Harness) -> (Vec<UpstreamZoneInput>, Vec<VHostZoneInput>) {
    let balancers = h.api.balancers();
    assert_eq!(balancers.len(), 1);
    let spec = h.api.applied_spec(&balancers[0].id).unwrap();
    (spec.upstream_zones, spec.vhost_zones)
}

#[tokio::test]
async fn two_nodes_one_host() {
    let h = harness();
    cluster(&h);
    h.store.apply(ingress("test-ingress", "example.com", "test-service", 80));

    h.reconciler.reconcile(&key()).await.unwrap();

    let (upstreams, vhosts) = applied_zones(&h);
    assert_eq!(upstreams.len(), 1);
    assert_eq!(
        upstreams[0].upstreams,
        [
            UpstreamInput {
                ip: "192.168.1.1".to_owned(),
                port: 30000,
                weight: 1,
            },
            UpstreamInput {
                ip: "192.168.1.2".to_owned(),
                port: 30000,
                weight: 1,
            },
        ]
    );
    assert_eq!(vhosts.len(), 1);
    assert_eq!(vhosts[0].domains, ["example.com"]);
    assert!(!vhosts[0].ssl);
}

#[tokio::test]
async fn unchanged_ingress_is_not_updated() {
    let h = harness();
    cluster(&h);
    h.store.apply(ingress("test-ingress", "example.com", "test-service", 80));

    h.reconciler.reconcile(&key()).await.unwrap();
    h.reconciler.reconcile(&key()).await.unwrap();

    let calls = h.api.calls();
    assert_eq!(calls.create, 1);
    assert_eq!(calls.update, 0);
}

#[tokio::test]
async fn topology_change_updates_the_balancer() {
    let h = harness();
    cluster(&h);
    h.store.apply(ingress("test-ingress", "example.com", "test-service", 80));
    h.reconciler.reconcile(&key()).await.unwrap();

    h.store.apply(node("node3", "192.168.1.3", &[]));
    h.reconciler.reconcile(&key()).await.unwrap();

    assert_eq!(h.api.calls().update, 1);
    let (upstreams, _) = applied_zones(&h);
    assert_eq!(upstreams[0].upstreams.len(), 3);
}

#[tokio::test]
async fn certificate_without_dns_names_fails_before_any_balancer_call() {
    let h = harness();
    cluster(&h);
    h.store.apply(secret(
        "tls",
        &[(TLS_CERT_KEY, NO_DNS_PEM), (TLS_PRIVATE_KEY_KEY, LEAF_KEY)],
    ));
    h.store.apply(with_tls(
        ingress("test-ingress", "example.com", "test-service", 80),
        &["example.com"],
        "tls",
    ));

    let err = h.reconciler.reconcile(&key()).await.unwrap_err();

    assert!(matches!(&err, Error::Validation(msg) if msg.contains("dns names")));
    let calls = h.api.calls();
    assert_eq!(calls.search + calls.create + calls.update, 0);
    assert!(h.api.certificates().is_empty());
}

#[tokio::test]
async fn deleted_ingress_is_cleaned_up() {
    let h = harness();
    cluster(&h);
    h.store.apply(ingress("test-ingress", "example.com", "test-service", 80));
    h.reconciler.reconcile(&key()).await.unwrap();
    assert_eq!(h.api.balancers().len(), 1);

    let ing = h.store.get::<Ingress>(&key()).unwrap();
    h.store.delete(&*ing);
    h.reconciler.reconcile(&key()).await.unwrap();

    assert!(h.api.balancers().is_empty());
    assert_eq!(h.api.calls().delete, 1);
}

#[tokio::test]
async fn class_change_cleans_up_without_syncing() {
    let h = harness();
    cluster(&h);
    h.store.apply(ingress("test-ingress", "example.com", "test-service", 80));
    h.reconciler.reconcile(&key()).await.unwrap();

    let mut ing = (*h.store.get::<Ingress>(&key()).unwrap()).clone();
    ing.spec.as_mut().unwrap().ingress_class_name = None;
    let ing = with_annotation(ing, INGRESS_CLASS_ANNOTATION, "nginx");
    h.store.apply(ing);
    h.reconciler.reconcile(&key()).await.unwrap();

    let calls = h.api.calls();
    assert_eq!(calls.create, 1);
    assert_eq!(calls.update, 0);
    assert_eq!(calls.delete, 1);
    assert!(h.api.balancers().is_empty());
}

#[tokio::test]
async fn restarted_registry_adopts_existing_balancer() {
    let h = harness();
    cluster(&h);
    let ing = ingress("test-ingress", "example.com", "test-service", 80);
    let name = load_balancer_name(&ing);
    h.store.apply(ing);
    h.reconciler.reconcile(&key()).await.unwrap();

    let restarted = harness_on(Arc::clone(&h.api), Config::default());
    cluster(&restarted);
    restarted
        .store
        .apply(ingress("test-ingress", "example.com", "test-service", 80));
    restarted.reconciler.reconcile(&key()).await.unwrap();

    let calls = h.api.calls();
    assert_eq!(calls.create, 1);
    assert_eq!(calls.update, 1);
    assert!(h.api.balancer_by_name(&name).is_some());
}
