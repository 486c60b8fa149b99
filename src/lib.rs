//! l7-ingress-controller keeps remote L7 load balancers in sync with the
//! Ingress objects of a cluster.
//!
//! Watch events for ingresses, services, secrets and nodes land in a local
//! [`Store`], which turns every relevant change into an ingress key on a
//! [`RetryQueue`]. The [`Controller`] drains that queue into the
//! [`Reconciler`], which uploads the certificates an ingress needs, translates
//! it into a load balancer spec, creates or updates the remote load balancer
//! and finally publishes its addresses on the ingress status.
//!
//! Load balancers no ingress of this controller's class accounts for anymore
//! are deleted during cleanup.

pub mod annotations;
pub mod api;
pub mod cache;
pub mod cert;
pub mod config;
pub mod controller;
pub mod error;
pub mod ingress;
pub mod loadbalancer;
pub mod poller;
pub mod queue;
pub mod reconciler;
pub mod status;
pub mod tls;
pub mod watch;

pub use cache::{QualifiedName, Store};
pub use config::Config;
pub use controller::Controller;
pub use error::{Error, Result};
pub use queue::RetryQueue;
pub use reconciler::Reconciler;

#[cfg(test)]
mod tests;
