//! Halo DCS - leader election and cluster membership over etcd
//!
//! This crate provides:
//! - `DcsConfig`: configuration surface for the coordination layer
//! - `Cluster`, `Leader`, `Member`: snapshots of the cluster subtree
//! - `EtcdDcs`: the election engine (acquire, renew, yield, watch)
//! - `DatabaseState`: what the engine needs from the local database

pub mod config;
pub mod constants;
pub mod dcs;
pub mod error;
pub mod model;
pub mod traits;

pub use config::DcsConfig;
pub use dcs::{EtcdDcs, Role, WatchOutcome};
pub use error::{DcsError, Result};
pub use model::{Cluster, Failover, Leader, Member};
pub use traits::DatabaseState;
