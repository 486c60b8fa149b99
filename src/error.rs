use thiserror::Error;

use crate::api::ApiError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconciliation engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The object is absent from the local cache.
    #[error("no object matching key {0:?} in local store")]
    NotFound(String),

    /// Malformed certificate material or missing secret fields.
    #[error("validation error: {0}")]
    Validation(String),

    /// The remote load balancer or certificate API failed.
    #[error("remote api error: {0}")]
    RemoteApi(#[from] ApiError),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    /// The cluster state cannot be expressed as a load balancer.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube_client::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
