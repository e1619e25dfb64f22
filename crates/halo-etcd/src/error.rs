//! Error types for the etcd store client

use crate::model::EtcdErrorBody;

/// etcd error code: key not found
pub const ECODE_KEY_NOT_FOUND: i64 = 100;
/// etcd error code: compare failed (prevValue / prevIndex mismatch)
pub const ECODE_TEST_FAILED: i64 = 101;
/// etcd error code: key already exists (prevExist=false)
pub const ECODE_NODE_EXIST: i64 = 105;

/// Error type for etcd store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EtcdError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("compare failed: {0}")]
    CompareFailed(String),

    #[error("operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("endpoint discovery failed: {0}")]
    EndpointDiscoveryFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Fieldless discriminant of [`EtcdError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyNotFound,
    KeyAlreadyExists,
    CompareFailed,
    OperationTimedOut,
    StoreUnreachable,
    StoreError,
    EndpointDiscoveryFailed,
    Config,
}

impl EtcdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EtcdError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            EtcdError::KeyAlreadyExists(_) => ErrorKind::KeyAlreadyExists,
            EtcdError::CompareFailed(_) => ErrorKind::CompareFailed,
            EtcdError::OperationTimedOut(_) => ErrorKind::OperationTimedOut,
            EtcdError::StoreUnreachable(_) => ErrorKind::StoreUnreachable,
            EtcdError::StoreError(_) => ErrorKind::StoreError,
            EtcdError::EndpointDiscoveryFailed(_) => ErrorKind::EndpointDiscoveryFailed,
            EtcdError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether retrying the whole operation later can help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreUnreachable | ErrorKind::EndpointDiscoveryFailed
        )
    }

    /// Map an etcd error document onto the typed vocabulary
    pub fn from_body(body: EtcdErrorBody) -> Self {
        let detail = match body.cause.as_deref() {
            Some(cause) if !cause.is_empty() => format!("{} ({})", body.message, cause),
            _ => body.message,
        };

        match body.error_code {
            ECODE_KEY_NOT_FOUND => EtcdError::KeyNotFound(detail),
            ECODE_TEST_FAILED => EtcdError::CompareFailed(detail),
            ECODE_NODE_EXIST => EtcdError::KeyAlreadyExists(detail),
            code => EtcdError::StoreError(format!("code={}, message={}", code, detail)),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtcdError>;
