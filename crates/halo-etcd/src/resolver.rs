//! Store endpoint discovery
//!
//! Turns the configured endpoint source into a list of base URLs:
//! - DNS SRV (`_etcd-server._tcp.<domain>`), asking each peer for its members
//! - a single `host:port` resolved through the system resolver
//! - a discovery service serving `{"servers": [...], "port": N}`
//! - a static host list
//!
//! Candidates are then verified against the store's own members API.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::client::EtcdClientConfig;
use crate::error::{EtcdError, Result};
use crate::model::{DiscoveryDocument, MembersResponse, StoreMember};

/// SRV service label used for store peers
pub const SRV_SERVICE: &str = "etcd-server";

/// Async SRV lookup, abstracted so discovery can run without real DNS
#[async_trait]
pub trait SrvLookup: Send + Sync {
    /// Return `(target, port)` pairs for the SRV record `name`
    async fn lookup_srv(&self, name: &str) -> Result<Vec<(String, u16)>>;
}

/// [`SrvLookup`] backed by the system resolver configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSrvLookup;

#[async_trait]
impl SrvLookup for SystemSrvLookup {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<(String, u16)>> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| EtcdError::EndpointDiscoveryFailed(e.to_string()))?;
        let response = resolver
            .srv_lookup(name)
            .await
            .map_err(|e| EtcdError::EndpointDiscoveryFailed(e.to_string()))?;

        Ok(response
            .iter()
            .map(|record| {
                let target = record.target().to_utf8();
                (target.trim_end_matches('.').to_string(), record.port())
            })
            .collect())
    }
}

/// Resolves and verifies store endpoints
pub struct EndpointResolver {
    http: Client,
    protocol: String,
    srv: Arc<dyn SrvLookup>,
}

impl EndpointResolver {
    pub fn new(http: Client, protocol: &str) -> Self {
        Self {
            http,
            protocol: protocol.to_string(),
            srv: Arc::new(SystemSrvLookup),
        }
    }

    /// Replace the SRV lookup implementation
    pub fn with_srv_lookup(mut self, srv: Arc<dyn SrvLookup>) -> Self {
        self.srv = srv;
        self
    }

    /// SRV records for `_etcd-server._tcp.<domain>`; empty on any failure
    pub async fn get_srv_record(&self, domain: &str) -> Vec<(String, u16)> {
        let name = format!("_{}._tcp.{}", SRV_SERVICE, domain);
        match self.srv.lookup_srv(&name).await {
            Ok(records) => records,
            Err(e) => {
                warn!("SRV lookup of {} failed: {}", name, e);
                Vec::new()
            }
        }
    }

    /// Client URLs advertised by the peers found through SRV
    pub async fn machines_from_srv(&self, domain: &str) -> Vec<String> {
        let mut machines = Vec::new();

        for (host, port) in self.get_srv_record(domain).await {
            let url = format!("{}://{}:{}/members", self.protocol, host, port);
            match self.fetch_json::<Vec<StoreMember>>(&url).await {
                Ok(members) => {
                    for member in members {
                        machines.extend(member.client_urls);
                    }
                }
                Err(e) => warn!("Failed to get members from peer {}: {}", url, e),
            }
        }

        dedup(machines)
    }

    /// One URL per address the `host:port` name resolves to
    pub async fn machines_from_dns(&self, host_port: &str) -> Vec<String> {
        let Some((host, port)) = split_host_port(host_port) else {
            warn!("Invalid host:port '{}'", host_port);
            return Vec::new();
        };

        match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => dedup(
                addrs
                    .map(|addr| format!("{}://{}", self.protocol, addr))
                    .collect(),
            ),
            Err(e) => {
                warn!("Failed to resolve {}: {}", host_port, e);
                Vec::new()
            }
        }
    }

    /// Store endpoints listed by a discovery service
    pub async fn machines_from_discovery(&self, url: &str) -> Result<Vec<String>> {
        let document: DiscoveryDocument = self
            .fetch_json(url)
            .await
            .map_err(|e| EtcdError::EndpointDiscoveryFailed(format!("{}: {}", url, e)))?;

        Ok(document
            .servers
            .iter()
            .map(|server| format!("{}://{}:{}", self.protocol, server, document.port))
            .collect())
    }

    /// Static host list; entries without a scheme get the configured one
    pub fn machines_from_hosts(&self, hosts: &[String]) -> Vec<String> {
        dedup(
            hosts
                .iter()
                .map(|host| host.trim())
                .filter(|host| !host.is_empty())
                .map(|host| {
                    if host.contains("://") {
                        host.trim_end_matches('/').to_string()
                    } else {
                        format!("{}://{}", self.protocol, host)
                    }
                })
                .collect(),
        )
    }

    /// Candidate endpoints from the first configured source that yields any
    pub async fn candidates(&self, config: &EtcdClientConfig) -> Result<Vec<String>> {
        if !config.has_endpoint_source() {
            return Err(EtcdError::Config(
                "no host, hosts, discovery_srv or discovery_url configured".to_string(),
            ));
        }

        if let Some(domain) = &config.discovery_srv {
            let machines = self.machines_from_srv(domain).await;
            if !machines.is_empty() {
                return Ok(machines);
            }
        }

        if let Some(host) = &config.host {
            let machines = self.machines_from_dns(host).await;
            if !machines.is_empty() {
                return Ok(machines);
            }
        }

        if let Some(url) = &config.discovery_url {
            let machines = self.machines_from_discovery(url).await?;
            if !machines.is_empty() {
                return Ok(machines);
            }
        }

        Ok(self.machines_from_hosts(&config.hosts))
    }

    /// Ask each candidate for the store membership and collect advertised
    /// client URLs. Candidates that cannot answer are dropped.
    pub async fn verify(&self, candidates: &[String]) -> Vec<String> {
        let mut machines = Vec::new();

        for candidate in candidates {
            let url = format!("{}/v2/members", candidate.trim_end_matches('/'));
            match self.fetch_json::<MembersResponse>(&url).await {
                Ok(response) => {
                    let advertised: Vec<String> = response
                        .members
                        .into_iter()
                        .flat_map(|member| member.client_urls)
                        .collect();
                    if advertised.is_empty() {
                        machines.push(candidate.clone());
                    } else {
                        machines.extend(advertised);
                    }
                }
                Err(e) => debug!("Dropping endpoint {}: {}", candidate, e),
            }
        }

        dedup(
            machines
                .into_iter()
                .map(|m| m.trim_end_matches('/').to_string())
                .collect(),
        )
    }

    /// Resolve and verify; fails when no live endpoint is left
    pub async fn resolve(&self, config: &EtcdClientConfig) -> Result<Vec<String>> {
        let candidates = self.candidates(config).await?;
        if candidates.is_empty() {
            return Err(EtcdError::EndpointDiscoveryFailed(
                "no candidate endpoints found".to_string(),
            ));
        }

        let machines = self.verify(&candidates).await;
        if machines.is_empty() {
            return Err(EtcdError::EndpointDiscoveryFailed(format!(
                "none of {:?} answered the members API",
                candidates
            )));
        }

        debug!("Resolved store endpoints: {:?}", machines);
        Ok(machines)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> std::result::Result<T, reqwest::Error> {
        self.http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await
    }
}

fn split_host_port(host_port: &str) -> Option<(&str, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
