//! Registry of TLS certificates uploaded to the remote API, keyed by fingerprint.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use tokio::sync::Mutex;

use crate::{
    api::{CertificateApi, CustomCertificateInput, SslCertificate},
    error::{Error, Result},
};

/// A certificate known to exist remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResource {
    pub fingerprint: String,
    pub remote_id: String,
    pub name: String,
    pub last_refresh: DateTime<Utc>,
}

impl CertificateResource {
    fn from_remote(certificate: SslCertificate) -> Self {
        Self {
            fingerprint: certificate.sha1_fingerprint,
            remote_id: certificate.id,
            name: certificate.name,
            last_refresh: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    async fn has_registration(&self, fingerprint: &str) -> bool;

    /// Makes sure a certificate with this fingerprint exists remotely and is registered.
    ///
    /// An already registered fingerprint is returned as is. Otherwise a remote
    /// certificate with the same fingerprint is adopted if one exists, and
    /// only then is the key material uploaded.
    async fn sync_certificate(
        &self,
        fingerprint: &str,
        name: &str,
        certificate: &str,
        private_key: &str,
        chain: Option<&str>,
    ) -> Result<CertificateResource>;

    /// Looks up a registered fingerprint without contacting the remote API.
    async fn get(&self, fingerprint: &str) -> Result<CertificateResource>;

    /// Fetches a certificate managed outside the cluster by its remote id.
    async fn get_by_id(&self, id: &str) -> Result<CertificateResource>;
}

pub struct TlsRegistry {
    certificates: Mutex<HashMap<String, CertificateResource>>,
    api: Arc<dyn CertificateApi>,
}

impl TlsRegistry {
    pub fn new(api: Arc<dyn CertificateApi>) -> Self {
        Self {
            certificates: Mutex::new(HashMap::new()),
            api,
        }
    }
}

#[async_trait]
impl CertificateManager for TlsRegistry {
    async fn has_registration(&self, fingerprint: &str) -> bool {
        self.certificates.lock().await.contains_key(fingerprint)
    }

    async fn sync_certificate(
        &self,
        fingerprint: &str,
        name: &str,
        certificate: &str,
        private_key: &str,
        chain: Option<&str>,
    ) -> Result<CertificateResource> {
        let mut certificates = self.certificates.lock().await;
        if let Some(resource) = certificates.get(fingerprint) {
            return Ok(resource.clone());
        }

        let existing = self
            .api
            .search(fingerprint)
            .await?
            .into_iter()
            .find(|remote| remote.sha1_fingerprint.eq_ignore_ascii_case(fingerprint));

        let remote = match existing {
            Some(remote) => {
                info!("Adopting certificate {} for fingerprint {fingerprint}", remote.id);
                remote
            }
            None => {
                info!("Uploading certificate {name} with fingerprint {fingerprint}");
                self.api
                    .create_custom(&CustomCertificateInput {
                        name: name.to_owned(),
                        public_key: certificate.to_owned(),
                        private_key: private_key.to_owned(),
                        chain_key: chain.map(str::to_owned),
                    })
                    .await?
            }
        };

        let resource = CertificateResource {
            fingerprint: fingerprint.to_owned(),
            ..CertificateResource::from_remote(remote)
        };
        certificates.insert(fingerprint.to_owned(), resource.clone());
        Ok(resource)
    }

    async fn get(&self, fingerprint: &str) -> Result<CertificateResource> {
        self.certificates
            .lock()
            .await
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("certificate {fingerprint}")))
    }

    async fn get_by_id(&self, id: &str) -> Result<CertificateResource> {
        let _guard = self.certificates.lock().await;
        let remote = self.api.get_custom(id).await?;
        Ok(CertificateResource::from_remote(remote))
    }
}
