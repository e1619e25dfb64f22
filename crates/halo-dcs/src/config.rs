//! Configuration for the DCS layer
//!
//! Loaded from an optional YAML file overlaid by `HALO_`-prefixed environment
//! variables, e.g. `HALO_SCOPE=batman`, `HALO_DISCOVERY_SRV=example.com`,
//! `HALO_HOSTS=10.0.0.1:2379,10.0.0.2:2379`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use halo_etcd::{EtcdClientConfig, RetryPolicy};
use serde::Deserialize;

use crate::constants::{DEFAULT_NAMESPACE, DEFAULT_TTL};
use crate::error::{DcsError, Result};

/// Configuration for the etcd-backed DCS
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DcsConfig {
    /// Name of this instance; the value written to the leader key
    pub name: String,
    /// Cluster namespace segment
    pub scope: String,
    /// Key prefix shared by all clusters (default: "/service")
    pub namespace: String,
    /// Leader and member lease in seconds (default: 30)
    pub ttl: u64,
    /// Single `host:port` resolved through DNS
    pub host: Option<String>,
    /// Static endpoint list
    pub hosts: Vec<String>,
    /// Domain queried for `_etcd-server._tcp` SRV records
    pub discovery_srv: Option<String>,
    /// URL of a discovery service listing store hosts
    pub discovery_url: Option<String>,
    /// URL scheme of store endpoints (default: "http")
    pub protocol: String,
    pub cacert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Per-attempt request timeout in milliseconds (default: 10000)
    pub request_timeout_ms: u64,
    /// Attempts at reaching the store on startup (default: 5)
    pub retry_attempts: u32,
    /// Delay between startup attempts in milliseconds (default: 5000)
    pub retry_delay_ms: u64,
}

impl Default for DcsConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            scope: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: DEFAULT_TTL,
            host: None,
            hosts: Vec::new(),
            discovery_srv: None,
            discovery_url: None,
            protocol: "http".to_string(),
            cacert: None,
            cert: None,
            key: None,
            request_timeout_ms: 10000,
            retry_attempts: 5,
            retry_delay_ms: 5000,
        }
    }
}

impl DcsConfig {
    /// Create a config for instance `name` in cluster `scope`
    pub fn new(name: &str, scope: &str) -> Self {
        Self {
            name: name.to_string(),
            scope: scope.to_string(),
            ..Default::default()
        }
    }

    /// Load from an optional YAML file and `HALO_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("HALO")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("hosts")
                .try_parsing(true),
        );

        let config: DcsConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_discovery_srv(mut self, domain: &str) -> Self {
        self.discovery_srv = Some(domain.to_string());
        self
    }

    pub fn with_discovery_url(mut self, url: &str) -> Self {
        self.discovery_url = Some(url.to_string());
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Reject configurations the DCS cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DcsError::Config("name must not be empty".to_string()));
        }
        if self.scope.trim().is_empty() {
            return Err(DcsError::Config("scope must not be empty".to_string()));
        }
        if self.ttl == 0 {
            return Err(DcsError::Config("ttl must be positive".to_string()));
        }
        if !self.to_client_config().has_endpoint_source() {
            return Err(DcsError::Config(
                "one of host, hosts, discovery_srv or discovery_url is required".to_string(),
            ));
        }
        Ok(())
    }

    /// `<namespace>/<scope>`
    pub fn base_path(&self) -> String {
        let namespace = self.namespace.trim_end_matches('/');
        let namespace = if namespace.starts_with('/') {
            namespace.to_string()
        } else {
            format!("/{}", namespace)
        };
        format!("{}/{}", namespace.trim_end_matches('/'), self.scope.trim_matches('/'))
    }

    pub fn to_client_config(&self) -> EtcdClientConfig {
        let mut config = EtcdClientConfig::with_hosts(self.hosts.clone())
            .with_protocol(&self.protocol)
            .with_tls(self.cacert.clone(), self.cert.clone(), self.key.clone());
        config.request_timeout_ms = self.request_timeout_ms;
        config.host = self.host.clone();
        config.discovery_srv = self.discovery_srv.clone();
        config.discovery_url = self.discovery_url.clone();
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}
