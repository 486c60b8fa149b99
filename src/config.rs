use std::{collections::BTreeMap, env, time::Duration};

use crate::{
    error::{Error, Result},
    queue::ExponentialBackoff,
};

pub const DEFAULT_API_URL: &str = "https://api.servers.com/v1";
pub const DEFAULT_INGRESS_CLASS: &str = "serverscom";
pub const DEFAULT_CERT_MANAGER_PREFIX: &str = "sc-certmgr-cert-id-";
pub const DEFAULT_LOCATION_ID: i64 = 1;

/// Parameters for the controller, built once and threaded into every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Token for the remote API.
    pub access_token: String,
    /// Base URL of the remote API.
    pub api_url: String,
    /// Location used for new load balancers unless an ingress overrides it.
    pub location_id: i64,
    /// The ingress class handled by this controller.
    pub ingress_class: String,
    /// Secret names with this prefix reference a remote certificate id instead of a secret.
    pub cert_manager_prefix: String,
    /// Namespace to watch, or all namespaces if unset.
    pub namespace: Option<String>,
    /// Number of queue workers.
    pub workers: usize,
    /// Times a failed key is requeued before it is dropped.
    pub max_requeues: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Log storage region codes mapped to region ids.
    pub log_regions: BTreeMap<String, i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            api_url: DEFAULT_API_URL.to_owned(),
            location_id: DEFAULT_LOCATION_ID,
            ingress_class: DEFAULT_INGRESS_CLASS.to_owned(),
            cert_manager_prefix: DEFAULT_CERT_MANAGER_PREFIX.to_owned(),
            namespace: None,
            workers: 1,
            max_requeues: 2,
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(30 * 60),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            log_regions: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Builds a config from `SC_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let fetch = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let mut config = Self::default();

        config.access_token = fetch("SC_ACCESS_TOKEN").ok_or_else(|| {
            Error::configuration("SC_ACCESS_TOKEN env is empty, can't create API client")
        })?;
        if let Some(url) = fetch("SC_API_URL") {
            config.api_url = url;
        }
        if let Some(location) = fetch("SC_LOCATION_ID") {
            config.location_id = location.trim().parse().map_err(|err| {
                Error::configuration(format!("can't parse SC_LOCATION_ID {location:?}: {err}"))
            })?;
        }
        if let Some(class) = fetch("SC_INGRESS_CLASS") {
            config.ingress_class = class;
        }
        if let Some(prefix) = fetch("SC_CERT_MANAGER_PREFIX") {
            config.cert_manager_prefix = prefix;
        }
        config.namespace = fetch("SC_NAMESPACE");
        if let Some(regions) = fetch("SC_LOG_REGIONS") {
            config.log_regions = parse_regions(&regions)?;
        }

        Ok(config)
    }

    /// The ingress class, falling back to the default one when left empty.
    pub fn ingress_class(&self) -> &str {
        if self.ingress_class.is_empty() {
            DEFAULT_INGRESS_CLASS
        } else {
            &self.ingress_class
        }
    }

    /// Retry delays for failed ingress keys.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            base: self.backoff_base,
            max: self.backoff_max,
        }
    }

    /// Resolves a log storage region code, ignoring case.
    pub fn region_id(&self, code: &str) -> Option<i64> {
        self.log_regions
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(code))
            .map(|(_, id)| *id)
    }
}

fn parse_regions(input: &str) -> Result<BTreeMap<String, i64>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (code, id) = entry.split_once('=').ok_or_else(|| {
                Error::configuration(format!("log region entry {entry:?} is not CODE=ID"))
            })?;
            let id = id.trim().parse().map_err(|err| {
                Error::configuration(format!("log region {code:?} has invalid id: {err}"))
            })?;
            Ok((code.trim().to_owned(), id))
        })
        .collect()
}
