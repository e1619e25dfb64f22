// Error types for the DCS layer

use halo_etcd::EtcdError;

/// Errors surfaced to the control loop
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DcsError {
    /// The store could not serve a request that has no safe fallback
    #[error("coordination unavailable: {0}")]
    CoordinationUnavailable(#[from] EtcdError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for DcsError {
    fn from(e: config::ConfigError) -> Self {
        DcsError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DcsError>;
