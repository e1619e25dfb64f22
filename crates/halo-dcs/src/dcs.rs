//! Leader election and membership on top of etcd
//!
//! Every mutating operation is a single conditional request against the
//! store, so at-most-one-leader holds across any number of agents without
//! local locking. Expected contention (losing a race, a stale leader failing
//! to renew, a missing cluster) is reported as a boolean or an empty value;
//! only an unreadable cluster is an error.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use halo_etcd::{
    DeleteOptions, Delay, EtcdClient, EtcdError, ReadOptions, TokioDelay, WriteOptions,
};
use tracing::{debug, error, info, warn};

use crate::config::DcsConfig;
use crate::constants::{MIN_WATCH_TIMEOUT_MS, cluster_key};
use crate::error::{DcsError, Result};
use crate::model::{Cluster, Failover, Leader};
use crate::traits::DatabaseState;

/// Local view of this instance's role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Result of [`EtcdDcs::watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The leader key changed or went away; fetch a fresh cluster
    Changed,
    /// No watch ran for the rest of the window: there was nothing to watch,
    /// too little time was left, or the store failed. The remainder was
    /// waited out; keep the cached cluster
    Unchanged,
    /// The long-poll ran until the window closed without an answer. This is
    /// how a quiet window ends against a healthy store; keep the cached
    /// cluster
    TimedOut,
}

impl WatchOutcome {
    pub fn should_refresh(&self) -> bool {
        matches!(self, WatchOutcome::Changed)
    }
}

/// etcd-backed distributed configuration store
pub struct EtcdDcs {
    client: EtcdClient,
    name: String,
    ttl: u64,
    base_path: String,
    delay: Arc<dyn Delay>,
    cluster: RwLock<Option<Cluster>>,
    role: RwLock<Role>,
}

impl EtcdDcs {
    /// Connect to the store described by `config`, retrying endpoint
    /// discovery according to the configured policy
    pub async fn connect(config: DcsConfig) -> Result<Self> {
        Self::connect_with_delay(config, Arc::new(TokioDelay)).await
    }

    /// Like [`EtcdDcs::connect`], with a custom delay between attempts and
    /// while pacing watches
    pub async fn connect_with_delay(config: DcsConfig, delay: Arc<dyn Delay>) -> Result<Self> {
        config.validate()?;

        let client_config = config.to_client_config();
        let client = config
            .retry_policy()
            .run(delay.as_ref(), |attempt| {
                debug!("Connecting to store, attempt {}", attempt);
                EtcdClient::new(client_config.clone())
            })
            .await?;

        info!(
            "Connected to store for {} at {:?}",
            config.base_path(),
            client.machines()
        );
        Ok(Self::from_client(&config, client, delay))
    }

    /// Wrap an already constructed client
    pub fn from_client(config: &DcsConfig, client: EtcdClient, delay: Arc<dyn Delay>) -> Self {
        Self {
            client,
            name: config.name.clone(),
            ttl: config.ttl,
            base_path: config.base_path(),
            delay,
            cluster: RwLock::new(None),
            role: RwLock::new(Role::Follower),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &EtcdClient {
        &self.client
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_path, suffix)
    }

    fn member_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.base_path, cluster_key::MEMBERS, name)
    }

    pub fn role(&self) -> Role {
        *self.role.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_role(&self, role: Role) {
        let mut current = self.role.write().unwrap_or_else(|e| e.into_inner());
        if *current != role {
            info!("{} is now {}", self.name, role);
            *current = role;
        }
    }

    /// The snapshot taken by the last successful [`EtcdDcs::get_cluster`]
    pub fn cluster(&self) -> Option<Cluster> {
        self.cluster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Read the whole cluster subtree into a fresh snapshot.
    ///
    /// A missing subtree is an empty cluster; any other store failure is
    /// [`DcsError::CoordinationUnavailable`].
    pub async fn get_cluster(&self) -> Result<Cluster> {
        let path = format!("{}/", self.base_path);

        let cluster = match self.client.read(&path, &ReadOptions::recursive()).await {
            Ok(result) => Cluster::from_node(&result.node, &self.base_path),
            Err(EtcdError::KeyNotFound(_)) => {
                debug!("Cluster {} does not exist yet", self.base_path);
                Cluster::empty()
            }
            Err(e) => {
                error!("Failed to read cluster {}: {}", self.base_path, e);
                return Err(DcsError::CoordinationUnavailable(e));
            }
        };

        let mut cached = self.cluster.write().unwrap_or_else(|e| e.into_inner());
        *cached = Some(cluster.clone());
        Ok(cluster)
    }

    /// Current leader, or `None` when unlocked or the store is unavailable
    pub async fn current_leader(&self) -> Option<Leader> {
        match self.get_cluster().await {
            Ok(cluster) => cluster.leader,
            Err(e) => {
                warn!("Unable to determine current leader: {}", e);
                None
            }
        }
    }

    /// Refresh the member record of `name` under the lease TTL
    pub async fn touch_member(&self, name: &str, connection_string: &str) -> bool {
        match self
            .client
            .set(&self.member_key(name), connection_string, Some(self.ttl))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to touch member {}: {}", name, e);
                false
            }
        }
    }

    /// Create the leader key if nobody holds it
    pub async fn attempt_to_acquire_leader(&self) -> bool {
        let options = WriteOptions::new()
            .with_ttl(self.ttl)
            .with_prev_exist(false);

        match self
            .client
            .write(&self.key(cluster_key::LEADER), &self.name, &options)
            .await
        {
            Ok(_) => {
                info!("{} acquired the leader lock", self.name);
                self.set_role(Role::Leader);
                true
            }
            Err(EtcdError::KeyAlreadyExists(_)) => {
                info!("Could not take out TTL lock: leader key already exists");
                false
            }
            Err(e) => {
                error!("Failed to acquire leader lock: {}", e);
                false
            }
        }
    }

    /// Overwrite the leader key with this instance, ignoring the current
    /// holder. Only meant for force-bootstrapping a cluster.
    pub async fn take_leader(&self) -> bool {
        match self
            .client
            .set(&self.key(cluster_key::LEADER), &self.name, Some(self.ttl))
            .await
        {
            Ok(_) => {
                warn!("{} forcibly took the leader key", self.name);
                self.set_role(Role::Leader);
                true
            }
            Err(e) => {
                error!("Failed to take leader key: {}", e);
                false
            }
        }
    }

    /// Renew the leader lease if this instance still holds it, then record
    /// the database's last operation. `false` means leadership is lost.
    pub async fn update_leader(&self, db: &dyn DatabaseState) -> bool {
        let result = self
            .client
            .test_and_set(
                &self.key(cluster_key::LEADER),
                &self.name,
                &self.name,
                Some(self.ttl),
            )
            .await;

        match result {
            Ok(_) => {
                self.write_leader_optime(db).await;
                true
            }
            Err(e) => {
                match e {
                    EtcdError::CompareFailed(_) | EtcdError::KeyNotFound(_) => {
                        warn!("{} no longer holds the leader key: {}", self.name, e)
                    }
                    _ => error!("Failed to renew leader lease: {}", e),
                }
                self.set_role(Role::Follower);
                false
            }
        }
    }

    /// Best-effort write of the leader's last operation
    pub async fn write_leader_optime(&self, db: &dyn DatabaseState) -> bool {
        let last_operation = db.last_operation();
        match self
            .client
            .set(&self.key(cluster_key::OPTIME_LEADER), &last_operation, None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Failed to write last operation {} of {}: {}",
                    last_operation,
                    db.name(),
                    e
                );
                false
            }
        }
    }

    /// Claim the bootstrap marker; `true` only for the race winner
    pub async fn initialize(&self) -> bool {
        let options = WriteOptions::new().with_prev_exist(false);
        match self
            .client
            .write(&self.key(cluster_key::INITIALIZE), &self.name, &options)
            .await
        {
            Ok(_) => true,
            Err(EtcdError::KeyAlreadyExists(_)) => {
                info!("Cluster {} is already being initialized", self.base_path);
                false
            }
            Err(e) => {
                error!("Failed to claim initialize key: {}", e);
                false
            }
        }
    }

    async fn delete_key(&self, suffix: &str) -> bool {
        match self
            .client
            .delete(&self.key(suffix), &DeleteOptions::default())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to delete {}: {}", self.key(suffix), e);
                false
            }
        }
    }

    /// Drop the bootstrap marker after an abandoned initialization
    pub async fn cancel_initialization(&self) -> bool {
        self.delete_key(cluster_key::INITIALIZE).await
    }

    /// Release the leader key on voluntary demotion
    pub async fn delete_leader(&self) -> bool {
        let deleted = self.delete_key(cluster_key::LEADER).await;
        if deleted {
            self.set_role(Role::Follower);
        }
        deleted
    }

    /// Write the failover key, optionally only if it is still at `index`
    pub async fn set_failover_value(&self, value: &str, index: Option<u64>) -> bool {
        let mut options = WriteOptions::new();
        options.prev_index = index;

        match self
            .client
            .write(&self.key(cluster_key::FAILOVER), value, &options)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to write failover key: {}", e);
                false
            }
        }
    }

    /// Request a manual failover away from `leader` and/or to `candidate`
    pub async fn manual_failover(&self, leader: Option<&str>, candidate: Option<&str>) -> bool {
        let failover = Failover {
            index: 0,
            leader: leader.map(str::to_string),
            member: candidate.map(str::to_string),
        };
        self.set_failover_value(&failover.to_value(), None).await
    }

    pub async fn delete_failover(&self) -> bool {
        self.delete_key(cluster_key::FAILOVER).await
    }

    /// Block for up to `timeout` waiting for the leader key to change.
    ///
    /// Only watches when the cached cluster has a leader other than this
    /// instance; otherwise the window is simply waited out. Lease renewals by
    /// the same leader do not count as a change. The store client holds every
    /// poll, failover included, to the remaining window. Never fails.
    pub async fn watch(&self, timeout: Duration) -> WatchOutcome {
        let deadline = Instant::now() + timeout;

        let leader = self
            .cluster()
            .and_then(|cluster| cluster.leader)
            .filter(|leader| leader.name() != self.name);
        let Some(leader) = leader else {
            self.delay.sleep(timeout).await;
            return WatchOutcome::Unchanged;
        };

        let leader_key = self.key(cluster_key::LEADER);
        let mut index = leader.index;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < Duration::from_millis(MIN_WATCH_TIMEOUT_MS) {
                self.delay.sleep(remaining).await;
                return WatchOutcome::Unchanged;
            }

            match self
                .client
                .watch(&leader_key, Some(index + 1), remaining, false)
                .await
            {
                Ok(result) => {
                    let renewed = matches!(
                        result.action.as_str(),
                        "set" | "compareAndSwap" | "update"
                    ) && result.value() == Some(leader.name());

                    if !renewed {
                        debug!(
                            "Leader key changed: {} -> {:?}",
                            result.action,
                            result.value()
                        );
                        return WatchOutcome::Changed;
                    }
                    index = result.modified_index().max(index + 1);
                }
                Err(EtcdError::OperationTimedOut(_)) => return WatchOutcome::TimedOut,
                Err(e) => {
                    warn!("Watch on {} failed: {}", leader_key, e);
                    self.delay
                        .sleep(deadline.saturating_duration_since(Instant::now()))
                        .await;
                    return WatchOutcome::Unchanged;
                }
            }
        }
    }
}
