// Member and leader value types

use chrono::{DateTime, Utc};
use halo_etcd::EtcdNode;
use serde::{Deserialize, Serialize};

/// A registered database instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Store modification index of the member record
    pub version: u64,
    pub name: String,
    /// Lease/session token; etcd leases are per key, so usually absent
    pub session: Option<String>,
    /// Connection string and metadata
    pub data: String,
    /// Absolute RFC 3339 expiration time; absent when the record has no TTL
    pub expiration: Option<String>,
    pub ttl: Option<i64>,
}

impl Member {
    pub fn new(version: u64, name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            session: None,
            data: data.into(),
            expiration: None,
            ttl: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Build a member from its record under `members/`
    pub fn from_node(node: &EtcdNode) -> Self {
        let name = node.key.rsplit('/').next().unwrap_or_default();
        Self {
            version: node.modified_index,
            name: name.to_string(),
            session: None,
            data: node.value.clone().unwrap_or_default(),
            expiration: node.expiration.clone().filter(|e| !e.is_empty()),
            ttl: node.ttl,
        }
    }

    /// The record this member is stored as below `members_dir`
    pub fn to_node(&self, members_dir: &str) -> EtcdNode {
        EtcdNode {
            key: format!("{}/{}", members_dir.trim_end_matches('/'), self.name),
            value: Some(self.data.clone()),
            ttl: self.ttl,
            expiration: self.expiration.clone(),
            modified_index: self.version,
            created_index: self.version,
            ..Default::default()
        }
    }

    /// Seconds until the record expires, or -1 if it never does
    pub fn real_ttl(&self) -> i64 {
        self.real_ttl_at(Utc::now())
    }

    pub fn real_ttl_at(&self, now: DateTime<Utc>) -> i64 {
        let Some(expiration) = self.expiration.as_deref().filter(|e| !e.is_empty()) else {
            return -1;
        };

        match DateTime::parse_from_rfc3339(expiration) {
            Ok(expires_at) => (expires_at.with_timezone(&Utc) - now).num_seconds().max(0),
            Err(_) => -1,
        }
    }
}

/// Holder of the leader key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leader {
    /// Store modification index of the leader key
    pub index: u64,
    pub member: Member,
}

impl Leader {
    pub fn new(index: u64, member: Member) -> Self {
        Self { index, member }
    }

    pub fn name(&self) -> &str {
        &self.member.name
    }
}
