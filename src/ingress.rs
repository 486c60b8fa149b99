//! Read-only views over `networking.k8s.io/v1` Ingress objects.

use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend, IngressTLS};

use crate::config::DEFAULT_INGRESS_CLASS;

/// Legacy annotation selecting the ingress class.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Per-host certificate override: `<prefix><host>` maps to a secret name or external certificate id.
pub const CERTIFICATE_ANNOTATION_PREFIX: &str = "servers.com/certificate-";

/// Whether the ingress belongs to `class`, or to the default class if `class` is empty.
///
/// `spec.ingressClassName` takes precedence over the legacy annotation.
pub fn is_controlled(ingress: &Ingress, class: &str) -> bool {
    let class = if class.is_empty() {
        DEFAULT_INGRESS_CLASS
    } else {
        class
    };

    if let Some(name) = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
    {
        return name == class;
    }

    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(INGRESS_CLASS_ANNOTATION))
        .is_some_and(|value| value == class)
}

pub fn tls_bindings(ingress: &Ingress) -> &[IngressTLS] {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.tls.as_deref())
        .unwrap_or_default()
}

/// `(host, value)` pairs of per-host certificate override annotations.
pub fn certificate_overrides(ingress: &Ingress) -> impl Iterator<Item = (&str, &str)> {
    ingress
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter_map(|(key, value)| {
            key.strip_prefix(CERTIFICATE_ANNOTATION_PREFIX)
                .filter(|host| !host.is_empty())
                .map(|host| (host, value.as_str()))
        })
}

/// Service backends of every rule path, in declaration order.
pub fn service_backends(ingress: &Ingress) -> impl Iterator<Item = &IngressServiceBackend> {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .flat_map(|rule| rule.http.iter())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
}

/// Names of secrets the ingress reads certificates from.
///
/// Values carrying the external certificate prefix are remote ids, not secrets.
pub fn secret_names<'a>(
    ingress: &'a Ingress,
    cert_prefix: &'a str,
) -> impl Iterator<Item = &'a str> {
    let bound = tls_bindings(ingress)
        .iter()
        .filter_map(|tls| tls.secret_name.as_deref());
    let overridden = certificate_overrides(ingress).map(|(_, value)| value);

    bound.chain(overridden).filter(move |name| {
        !name.is_empty() && (cert_prefix.is_empty() || !name.starts_with(cert_prefix))
    })
}
