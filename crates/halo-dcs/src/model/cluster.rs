// Cluster snapshot and failover request

use halo_etcd::EtcdNode;
use serde::{Deserialize, Serialize};

use crate::constants::cluster_key;
use crate::model::member::{Leader, Member};

/// A pending manual failover request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failover {
    #[serde(skip)]
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

impl Failover {
    /// Parse a failover value, either a JSON object or `leader:member` text.
    /// Returns `None` when the value names nobody.
    pub fn parse(index: u64, value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        let mut failover = match serde_json::from_str::<Failover>(value) {
            Ok(failover) => failover,
            Err(_) => {
                let (leader, member) = value.split_once(':').unwrap_or((value, ""));
                Failover {
                    index: 0,
                    leader: non_empty(leader),
                    member: non_empty(member),
                }
            }
        };

        if failover.leader.is_none() && failover.member.is_none() {
            return None;
        }
        failover.index = index;
        Some(failover)
    }

    /// Value stored in the `failover` key
    pub fn to_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Point-in-time view of one cluster, rebuilt from the store on every read
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Name of the member that bootstrapped the cluster, if any
    pub initialize: Option<String>,
    pub leader: Option<Leader>,
    /// Last operation reported by the leader
    pub last_leader_operation: u64,
    pub members: Vec<Member>,
    pub failover: Option<Failover>,
}

impl Cluster {
    /// A cluster nobody has bootstrapped yet
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from the recursive listing of `base_path`
    pub fn from_node(root: &EtcdNode, base_path: &str) -> Self {
        let prefix = format!("{}/", base_path.trim_end_matches('/'));
        let members_prefix = format!("{}/", cluster_key::MEMBERS);

        let mut cluster = Cluster::empty();
        let mut leader_node = None;

        for node in root.leaves() {
            let Some(relative) = node.key.strip_prefix(&prefix) else {
                continue;
            };
            let value = node.value.as_deref().unwrap_or_default();

            match relative {
                cluster_key::INITIALIZE => cluster.initialize = Some(value.to_string()),
                cluster_key::LEADER => leader_node = Some(node),
                cluster_key::OPTIME_LEADER => {
                    cluster.last_leader_operation = value.trim().parse().unwrap_or(0);
                }
                cluster_key::FAILOVER => {
                    cluster.failover = Failover::parse(node.modified_index, value);
                }
                other if other.starts_with(&members_prefix) => {
                    let member = Member::from_node(node);
                    if !member.name.is_empty() && cluster.get_member(&member.name).is_none() {
                        cluster.members.push(member);
                    }
                }
                _ => {}
            }
        }

        cluster.leader = leader_node.and_then(|node| {
            let name = node.value.as_deref().filter(|v| !v.is_empty())?;
            let member = cluster
                .get_member(name)
                .cloned()
                .unwrap_or_else(|| Member::new(0, name, ""));
            Some(Leader::new(node.modified_index, member))
        });

        cluster
    }

    /// No member holds the leader key
    pub fn is_unlocked(&self) -> bool {
        self.leader.is_none()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialize.is_some()
    }

    pub fn leader_name(&self) -> Option<&str> {
        self.leader.as_ref().map(Leader::name)
    }

    pub fn get_member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}
