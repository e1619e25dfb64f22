// Cluster state model

pub mod cluster;
pub mod member;

pub use cluster::{Cluster, Failover};
pub use member::{Leader, Member};
