//! Error types for entitle operations

use crate::CustomerState;
use thiserror::Error;

/// Transport-level failures reported by the network collaborator.
///
/// These are never cached as negative results and are surfaced to callers as a
/// generic network error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Backend unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Transport failure: {reason}")]
    Transport { reason: String },
}

/// A structured rejection from the entitlement backend.
///
/// `finishable` records whether the server-side effect of the operation is
/// considered complete even though the call failed. When it is, resources the
/// caller holds for the operation (a pending store transaction) may be closed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Backend rejected request with status {status} (code {code:?}): {message}")]
pub struct BackendError {
    pub status: u16,
    pub code: Option<i64>,
    pub message: String,
    pub finishable: bool,
}

impl BackendError {
    /// Classify a backend rejection from its status code.
    ///
    /// Client errors (< 500) are finishable, server errors are not.
    pub fn from_status(status: u16, code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            finishable: status < 500,
        }
    }
}

/// Local validation or decoding failures on a backend response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Malformed response: {reason}")]
    Malformed { reason: String },

    #[error("Response missing required field: {field}")]
    MissingField { field: String },

    #[error("Incompatible snapshot schema version: {found:?}")]
    IncompatibleSchema { found: Option<String> },
}

/// Identity transition errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("App user id is empty")]
    EmptyAppUserId,

    #[error("App user id {app_user_id} is a generated anonymous id and cannot be logged in to")]
    AnonymousIdRejected { app_user_id: String },

    #[error("Cannot log out: the current user is anonymous")]
    LogOutAnonymousUser,

    #[error("Identity has not been configured")]
    NotConfigured,
}

/// Persistence-layer errors.
///
/// These never reach synchronizer callers; the cache logs them and degrades to
/// a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Serialization failed for {kind}: {reason}")]
    Serialization { kind: String, reason: String },

    #[error("Deserialization failed for {kind}: {reason}")]
    Deserialization { kind: String, reason: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all entitle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntitleError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Response error: {0}")]
    Response(#[from] ResponseError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No usable cached customer state for {app_user_id}")]
    CacheMiss { app_user_id: String },

    #[error("In-flight call was abandoned before completing")]
    CallAbandoned,
}

impl EntitleError {
    /// Whether the server-side effect of the failed operation is complete.
    ///
    /// Only backend rejections can be finishable; transport and local decoding
    /// failures never are.
    pub fn is_finishable(&self) -> bool {
        matches!(self, Self::Backend(err) if err.finishable)
    }

    /// Whether this is a transport failure.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Whether a stale cached value should accompany this error.
    ///
    /// Backend rejections and malformed responses are terminal for the attempt
    /// but informative; callers get the previous snapshot alongside them.
    pub fn serves_stale_fallback(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Response(_))
    }
}

/// Result type alias for entitle operations.
pub type EntitleResult<T> = Result<T, EntitleError>;

/// A failed customer state operation, with the degraded fallback if any.
///
/// `cached` carries the previously cached snapshot for the owner when the
/// failure is informative enough to still serve it. Callers decide whether
/// that data is usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct SyncFailure {
    pub error: EntitleError,
    pub cached: Option<CustomerState>,
}

impl SyncFailure {
    pub fn new(error: impl Into<EntitleError>) -> Self {
        Self {
            error: error.into(),
            cached: None,
        }
    }

    pub fn with_cached(error: impl Into<EntitleError>, cached: Option<CustomerState>) -> Self {
        Self {
            error: error.into(),
            cached,
        }
    }

    pub fn is_finishable(&self) -> bool {
        self.error.is_finishable()
    }
}

impl From<EntitleError> for SyncFailure {
    fn from(error: EntitleError) -> Self {
        Self::new(error)
    }
}

impl From<IdentityError> for SyncFailure {
    fn from(error: IdentityError) -> Self {
        Self::new(error)
    }
}

// =============================================================================
// TESTS
// =============================================================================
