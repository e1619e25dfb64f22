//! Halo etcd - failover-aware client for the etcd v2 API
//!
//! This crate provides:
//! - Endpoint discovery from DNS SRV records, a DNS name, a discovery service
//!   or a static host list
//! - A keys API client that caches live endpoints and fails over between them
//! - Typed store errors mapped from etcd error codes
//! - A bounded retry policy with an injectable delay

pub mod client;
pub mod error;
pub mod model;
pub mod resolver;
pub mod retry;

pub use client::{EtcdClient, EtcdClientConfig};
pub use error::{ErrorKind, EtcdError, Result};
pub use model::{DeleteOptions, EtcdNode, EtcdResult, ReadOptions, WriteOptions};
pub use resolver::{EndpointResolver, SrvLookup, SystemSrvLookup};
pub use retry::{Delay, RetryPolicy, TokioDelay};
