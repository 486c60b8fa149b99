//! Publishing load balancer addresses on ingress status.

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube_client::{
    api::{Patch, PatchParams},
    Api, Client,
};
use parking_lot::Mutex;
use serde_json::json;

use crate::{cache::QualifiedName, error::Result};

#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Replaces `status.loadBalancer.ingress` of the ingress with `addresses`.
    async fn write(&self, key: &QualifiedName, addresses: &[String]) -> Result<()>;
}

/// Patches the status subresource through the apiserver.
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn status_patch(addresses: &[String]) -> serde_json::Value {
    let ingress: Vec<_> = addresses.iter().map(|ip| json!({ "ip": ip })).collect();
    json!({ "status": { "loadBalancer": { "ingress": ingress } } })
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&self, key: &QualifiedName, addresses: &[String]) -> Result<()> {
        let api: Api<Ingress> = match &key.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        };
        api.patch_status(
            &key.name,
            &PatchParams::default(),
            &Patch::Merge(status_patch(addresses)),
        )
        .await?;
        Ok(())
    }
}

/// Records status writes in memory.
#[derive(Default)]
pub struct RecordingStatusWriter {
    writes: Mutex<Vec<(QualifiedName, Vec<String>)>>,
}

impl RecordingStatusWriter {
    pub fn writes(&self) -> Vec<(QualifiedName, Vec<String>)> {
        self.writes.lock().clone()
    }

    /// The addresses last written for `key`.
    pub fn last(&self, key: &QualifiedName) -> Option<Vec<String>> {
        self.writes
            .lock()
            .iter()
            .rev()
            .find(|(written, _)| written == key)
            .map(|(_, addresses)| addresses.clone())
    }
}

#[async_trait]
impl StatusWriter for RecordingStatusWriter {
    async fn write(&self, key: &QualifiedName, addresses: &[String]) -> Result<()> {
        self.writes.lock().push((key.clone(), addresses.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_lists_every_address() {
        let patch = status_patch(&["203.0.113.10".to_owned(), "203.0.113.11".to_owned()]);
        assert_eq!(
            patch,
            json!({
                "status": {
                    "loadBalancer": {
                        "ingress": [{ "ip": "203.0.113.10" }, { "ip": "203.0.113.11" }]
                    }
                }
            })
        );
    }

    #[tokio::test]
    async fn recorder_keeps_last_write_per_key() {
        let writer = RecordingStatusWriter::default();
        let key = QualifiedName::new("default", "test-ingress");
        writer.write(&key, &["10.0.0.1".to_owned()]).await.unwrap();
        writer.write(&key, &["10.0.0.2".to_owned()]).await.unwrap();

        assert_eq!(writer.last(&key), Some(vec!["10.0.0.2".to_owned()]));
        assert_eq!(writer.writes().len(), 2);
        assert_eq!(writer.last(&QualifiedName::new("default", "other")), None);
    }
}
