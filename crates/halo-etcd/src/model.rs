//! Wire model for the etcd v2 keys and members API

use serde::{Deserialize, Serialize};

/// A node in the etcd key space
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNode {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<EtcdNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default)]
    pub created_index: u64,
}

impl EtcdNode {
    /// Iterate over all leaf (non-directory) nodes below this one, depth first
    pub fn leaves(&self) -> Vec<&EtcdNode> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }
}

fn collect_leaves<'a>(node: &'a EtcdNode, out: &mut Vec<&'a EtcdNode>) {
    if node.dir || !node.nodes.is_empty() {
        for child in &node.nodes {
            collect_leaves(child, out);
        }
    } else {
        out.push(node);
    }
}

/// Successful response of a keys API call
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdResult {
    pub action: String,
    #[serde(default)]
    pub node: EtcdNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<EtcdNode>,
    /// Value of the `X-Etcd-Index` response header
    #[serde(skip)]
    pub etcd_index: Option<u64>,
}

impl EtcdResult {
    pub fn value(&self) -> Option<&str> {
        self.node.value.as_deref()
    }

    pub fn modified_index(&self) -> u64 {
        self.node.modified_index
    }
}

/// Error document returned by etcd for non-2xx responses
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdErrorBody {
    pub error_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub index: u64,
}

/// A store cluster member as reported by the members API
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMember {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    #[serde(rename = "clientURLs")]
    pub client_urls: Vec<String>,
}

/// Body of `GET /v2/members`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<StoreMember>,
}

/// Document served by a discovery service listing store hosts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub servers: Vec<String>,
    pub port: u16,
}

/// Options for a read
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    pub recursive: bool,
    pub quorum: bool,
}

impl ReadOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Default::default()
        }
    }

    pub(crate) fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if self.recursive {
            params.push(("recursive", "true".to_string()));
        }
        if self.quorum {
            params.push(("quorum", "true".to_string()));
        }
        params
    }
}

/// Options for a (possibly conditional) write
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub ttl: Option<u64>,
    pub prev_exist: Option<bool>,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
    pub dir: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_prev_exist(mut self, prev_exist: bool) -> Self {
        self.prev_exist = Some(prev_exist);
        self
    }

    pub fn with_prev_value(mut self, prev_value: &str) -> Self {
        self.prev_value = Some(prev_value.to_string());
        self
    }

    pub fn with_prev_index(mut self, prev_index: u64) -> Self {
        self.prev_index = Some(prev_index);
        self
    }

    pub(crate) fn to_params(&self, value: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("value", value.to_string())];
        if let Some(ttl) = self.ttl {
            params.push(("ttl", ttl.to_string()));
        }
        if let Some(prev_exist) = self.prev_exist {
            params.push(("prevExist", prev_exist.to_string()));
        }
        if let Some(prev_value) = &self.prev_value {
            params.push(("prevValue", prev_value.clone()));
        }
        if let Some(prev_index) = self.prev_index {
            params.push(("prevIndex", prev_index.to_string()));
        }
        if self.dir {
            params.push(("dir", "true".to_string()));
        }
        params
    }
}

/// Options for a delete
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub recursive: bool,
    pub dir: bool,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

impl DeleteOptions {
    pub(crate) fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if self.recursive {
            params.push(("recursive", "true".to_string()));
        }
        if self.dir {
            params.push(("dir", "true".to_string()));
        }
        if let Some(prev_value) = &self.prev_value {
            params.push(("prevValue", prev_value.clone()));
        }
        if let Some(prev_index) = self.prev_index {
            params.push(("prevIndex", prev_index.to_string()));
        }
        params
    }
}
