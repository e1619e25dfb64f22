//! etcd v2 client with endpoint caching and failover
//!
//! The client keeps an ordered cache of live store endpoints. Each operation
//! walks the cache starting from the most recently successful endpoint; the
//! endpoint that answers is moved to the front. When every cached endpoint
//! fails, the cache is rebuilt from the configured discovery source once
//! before giving up with [`EtcdError::StoreUnreachable`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use reqwest::{Certificate, Client, Identity, Method, StatusCode};
use tracing::{debug, info, warn};

use crate::error::{EtcdError, Result};
use crate::model::{DeleteOptions, EtcdErrorBody, EtcdResult, ReadOptions, WriteOptions};
use crate::resolver::{EndpointResolver, SrvLookup};

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Configuration for the etcd client
#[derive(Clone, Debug)]
pub struct EtcdClientConfig {
    /// URL scheme used for discovered endpoints ("http" or "https")
    pub protocol: String,
    /// Single `host:port` resolved through DNS
    pub host: Option<String>,
    /// Static endpoint list (`host:port` or full URLs)
    pub hosts: Vec<String>,
    /// Domain queried for `_etcd-server._tcp` SRV records
    pub discovery_srv: Option<String>,
    /// URL of a discovery service listing store hosts
    pub discovery_url: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-attempt request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// CA bundle used to verify store certificates
    pub cacert: Option<PathBuf>,
    /// Client certificate (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM), if not bundled with `cert`
    pub key: Option<PathBuf>,
}

impl Default for EtcdClientConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: None,
            hosts: vec!["127.0.0.1:2379".to_string()],
            discovery_srv: None,
            discovery_url: None,
            connect_timeout_ms: 3000,
            request_timeout_ms: 10000,
            cacert: None,
            cert: None,
            key: None,
        }
    }
}

impl EtcdClientConfig {
    /// Create a config with a static endpoint list
    pub fn with_hosts(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    /// Resolve endpoints through a single `host:port` DNS name
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Resolve endpoints through DNS SRV records of `domain`
    pub fn with_discovery_srv(mut self, domain: &str) -> Self {
        self.discovery_srv = Some(domain.to_string());
        self
    }

    /// Resolve endpoints through a discovery service
    pub fn with_discovery_url(mut self, url: &str) -> Self {
        self.discovery_url = Some(url.to_string());
        self
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, connect_ms: u64, request_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.request_timeout_ms = request_ms;
        self
    }

    /// Set TLS material
    pub fn with_tls(
        mut self,
        cacert: Option<PathBuf>,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    ) -> Self {
        self.cacert = cacert;
        self.cert = cert;
        self.key = key;
        self
    }

    pub fn has_endpoint_source(&self) -> bool {
        self.discovery_srv.is_some()
            || self.host.is_some()
            || self.discovery_url.is_some()
            || !self.hosts.is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A single keys API call, replayable against any endpoint
struct ApiRequest<'a> {
    method: Method,
    key: &'a str,
    params: Vec<(&'static str, String)>,
    /// Long-poll watch: every attempt, including the ones after a failover
    /// or cache reload, must finish by this instant
    deadline: Option<Instant>,
}

impl ApiRequest<'_> {
    fn timed_out(&self) -> EtcdError {
        EtcdError::OperationTimedOut(format!("watch {}", self.key))
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Outcome of trying one endpoint
enum Attempt {
    /// The endpoint answered; the result is final
    Done(Result<EtcdResult>),
    /// The watch window closed before the endpoint answered
    Expired,
    /// The endpoint failed; try the next one
    Failover(String),
}

/// etcd client with endpoint discovery and sticky failover
pub struct EtcdClient {
    client: Client,
    config: EtcdClientConfig,
    resolver: EndpointResolver,
    machines_cache: RwLock<Vec<String>>,
}

impl EtcdClient {
    /// Create a client and populate the endpoint cache from the configured
    /// discovery source
    pub async fn new(config: EtcdClientConfig) -> Result<Self> {
        let instance = Self::build(config, Vec::new())?;
        instance.load_machines_cache().await?;
        Ok(instance)
    }

    /// Like [`EtcdClient::new`], with a custom SRV lookup
    pub async fn new_with_srv_lookup(
        config: EtcdClientConfig,
        srv: Arc<dyn SrvLookup>,
    ) -> Result<Self> {
        let mut instance = Self::build(config, Vec::new())?;
        instance.resolver = instance.resolver.with_srv_lookup(srv);
        instance.load_machines_cache().await?;
        Ok(instance)
    }

    /// Create a client with a pre-populated endpoint cache, skipping
    /// discovery. The configured sources are still used to reload the cache.
    pub fn new_without_discovery(config: EtcdClientConfig, machines: Vec<String>) -> Result<Self> {
        Self::build(config, machines)
    }

    fn build(config: EtcdClientConfig, machines: Vec<String>) -> Result<Self> {
        let client = build_http_client(&config)?;
        let resolver = EndpointResolver::new(client.clone(), &config.protocol);

        Ok(Self {
            client,
            config,
            resolver,
            machines_cache: RwLock::new(machines),
        })
    }

    pub fn config(&self) -> &EtcdClientConfig {
        &self.config
    }

    /// Snapshot of the endpoint cache, preferred endpoint first
    pub fn machines(&self) -> Vec<String> {
        self.machines_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The currently preferred endpoint
    pub fn base_uri(&self) -> Option<String> {
        self.machines_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .cloned()
    }

    /// Rebuild the endpoint cache from the configured discovery source
    pub async fn load_machines_cache(&self) -> Result<()> {
        let machines = self.resolver.resolve(&self.config).await?;
        info!("Loaded store endpoint cache: {:?}", machines);

        let mut cache = self
            .machines_cache
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *cache = machines;
        Ok(())
    }

    /// Move `uri` to the front of the cache
    fn promote(&self, uri: &str) {
        let mut cache = self
            .machines_cache
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = cache.iter().position(|m| m == uri) {
            if pos != 0 {
                let machine = cache.remove(pos);
                cache.insert(0, machine);
                debug!("Switched preferred store endpoint to {}", uri);
            }
        }
    }

    /// Build full keys API URL
    fn build_url(base: &str, key: &str) -> String {
        let base = base.trim_end_matches('/');
        if key.starts_with('/') {
            format!("{}/v2/keys{}", base, key)
        } else {
            format!("{}/v2/keys/{}", base, key)
        }
    }

    /// Read a key
    pub async fn read(&self, key: &str, options: &ReadOptions) -> Result<EtcdResult> {
        self.api_execute(ApiRequest {
            method: Method::GET,
            key,
            params: options.to_params(),
            deadline: None,
        })
        .await
    }

    /// Read a single key with default options
    pub async fn get(&self, key: &str) -> Result<EtcdResult> {
        self.read(key, &ReadOptions::default()).await
    }

    /// Write a key, honoring any compare conditions in `options`
    pub async fn write(&self, key: &str, value: &str, options: &WriteOptions) -> Result<EtcdResult> {
        self.api_execute(ApiRequest {
            method: Method::PUT,
            key,
            params: options.to_params(value),
            deadline: None,
        })
        .await
    }

    /// Unconditional write with an optional TTL
    pub async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<EtcdResult> {
        let options = WriteOptions {
            ttl,
            ..Default::default()
        };
        self.write(key, value, &options).await
    }

    /// Write `value` only if the current value equals `prev_value`
    pub async fn test_and_set(
        &self,
        key: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<u64>,
    ) -> Result<EtcdResult> {
        let options = WriteOptions {
            ttl,
            prev_value: Some(prev_value.to_string()),
            ..Default::default()
        };
        self.write(key, value, &options).await
    }

    /// Delete a key
    pub async fn delete(&self, key: &str, options: &DeleteOptions) -> Result<EtcdResult> {
        self.api_execute(ApiRequest {
            method: Method::DELETE,
            key,
            params: options.to_params(),
            deadline: None,
        })
        .await
    }

    /// Block until `key` changes after `index`, or `timeout` elapses.
    ///
    /// `timeout` bounds the whole call, failover and cache reload included.
    /// An elapsed window surfaces as [`EtcdError::OperationTimedOut`]; the
    /// endpoint that was still polling is not promoted.
    pub async fn watch(
        &self,
        key: &str,
        index: Option<u64>,
        timeout: Duration,
        recursive: bool,
    ) -> Result<EtcdResult> {
        let mut params = vec![("wait", "true".to_string())];
        if let Some(index) = index {
            params.push(("waitIndex", index.to_string()));
        }
        if recursive {
            params.push(("recursive", "true".to_string()));
        }

        self.api_execute(ApiRequest {
            method: Method::GET,
            key,
            params,
            deadline: Some(Instant::now() + timeout),
        })
        .await
    }

    /// Execute a request against the endpoint cache with failover
    async fn api_execute(&self, request: ApiRequest<'_>) -> Result<EtcdResult> {
        let mut reloaded = false;
        let mut last_error = String::from("endpoint cache is empty");

        loop {
            for machine in self.machines() {
                if request.expired() {
                    return Err(request.timed_out());
                }
                match self.execute_on(&machine, &request).await {
                    Attempt::Done(result) => {
                        self.promote(&machine);
                        return result;
                    }
                    Attempt::Expired => return Err(request.timed_out()),
                    Attempt::Failover(reason) => {
                        warn!(
                            "Request to {} failed: {}, switching to next endpoint",
                            machine, reason
                        );
                        last_error = reason;
                    }
                }
            }

            if reloaded {
                break;
            }
            reloaded = true;

            info!("All cached store endpoints failed, reloading endpoint cache");
            let reload = match request.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::timeout(remaining, self.load_machines_cache())
                        .await
                        .map_err(|_| request.timed_out())?
                }
                None => self.load_machines_cache().await,
            };
            if let Err(e) = reload {
                warn!("Failed to reload store endpoint cache: {}", e);
                last_error = e.to_string();
                break;
            }
        }

        Err(EtcdError::StoreUnreachable(format!(
            "{} {}: {}",
            request.method, request.key, last_error
        )))
    }

    async fn execute_on(&self, base: &str, request: &ApiRequest<'_>) -> Attempt {
        let url = Self::build_url(base, request.key);

        let mut builder = self.client.request(request.method.clone(), &url);
        builder = if request.method == Method::PUT {
            builder.form(&request.params)
        } else {
            builder.query(&request.params)
        };
        if let Some(deadline) = request.deadline {
            builder = builder.timeout(deadline.saturating_duration_since(Instant::now()));
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Self::transport_failure(request, e),
        };

        let status = response.status();
        let etcd_index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        match response.bytes().await {
            Ok(body) => result_from_response(status, etcd_index, &body),
            Err(e) => Self::transport_failure(request, e),
        }
    }

    /// A watch that runs out its window got no answer, which is not an
    /// endpoint failure. Failing to connect always is.
    fn transport_failure(request: &ApiRequest<'_>, e: reqwest::Error) -> Attempt {
        if request.deadline.is_some() && e.is_timeout() && !e.is_connect() {
            return Attempt::Expired;
        }
        Attempt::Failover(e.to_string())
    }
}

/// Interpret a raw response. Bodies that are neither a result nor an etcd
/// error document mean the endpoint is unhealthy.
fn result_from_response(status: StatusCode, etcd_index: Option<u64>, body: &[u8]) -> Attempt {
    if status.is_success() {
        match serde_json::from_slice::<EtcdResult>(body) {
            Ok(mut result) => {
                result.etcd_index = etcd_index;
                Attempt::Done(Ok(result))
            }
            Err(e) => Attempt::Failover(format!("malformed response: {}", e)),
        }
    } else {
        match serde_json::from_slice::<EtcdErrorBody>(body) {
            Ok(error) => Attempt::Done(Err(EtcdError::from_body(error))),
            Err(_) => Attempt::Failover(format!("unexpected status {}", status)),
        }
    }
}

fn build_http_client(config: &EtcdClientConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(config.request_timeout());

    if let Some(cacert) = &config.cacert {
        let pem = read_pem(cacert)?;
        let certificate =
            Certificate::from_pem(&pem).map_err(|e| EtcdError::Config(e.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }

    if let Some(cert) = &config.cert {
        let mut pem = read_pem(cert)?;
        if let Some(key) = &config.key {
            pem.extend(read_pem(key)?);
        }
        let identity = Identity::from_pem(&pem).map_err(|e| EtcdError::Config(e.to_string()))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| EtcdError::Config(e.to_string()))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| EtcdError::Config(format!("failed to read {}: {}", path.display(), e)))
}
