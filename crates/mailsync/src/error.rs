//! Error types for backup runs
//!
//! Per-message failures ([`FetchError`], [`StorageError`]) are reported
//! through the event sink and never abort a run. [`SyncError`] is what
//! [`crate::SyncEngine::run`] returns when the run itself cannot continue.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;

/// OAuth2 authorization failures. Always fatal to a run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Authorization denied by the user: {0}")]
    ConsentDenied(String),

    #[error("Authorization flow failed: {0}")]
    Consent(String),

    #[error("Token request failed: {0}")]
    TokenRequest(String),

    #[error("Refresh token was rejected: {0}")]
    RefreshRejected(String),

    /// Network failure, 408, 429 or 5xx from the token endpoint
    #[error("Token endpoint unavailable: {0}")]
    TokenEndpointUnavailable(String),

    #[error("No refresh token available to renew the access token")]
    MissingRefreshToken,

    #[error("Not authorized yet")]
    NotAuthorized,

    #[error("Access token was rejected even after a refresh")]
    TokenRejected,
}

/// Classified failure of a single remote API call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized (401)")]
    Unauthorized,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        /// Server-requested delay before retrying (from `Retry-After`)
        retry_after: Option<Duration>,
    },

    #[error("Request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Create a transient error without a server-requested delay
    pub fn transient(message: impl Into<String>) -> Self {
        ApiError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short code reported alongside message errors
    pub fn code(&self) -> String {
        match self {
            ApiError::Unauthorized => "401".to_string(),
            ApiError::PermissionDenied(_) => "403".to_string(),
            ApiError::NotFound(_) => "404".to_string(),
            ApiError::Transient { .. } => "TRANSIENT".to_string(),
            ApiError::Request { status, .. } => status.to_string(),
            ApiError::Decode(_) => "DECODE".to_string(),
        }
    }
}

/// Failure to download a single message
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Giving up after {retries} retries: {message}")]
    Transient { retries: u32, message: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Remote(ApiError),
}

impl FetchError {
    pub fn code(&self) -> String {
        match self {
            FetchError::PermissionDenied(_) => "403".to_string(),
            FetchError::NotFound(_) => "404".to_string(),
            FetchError::Transient { .. } => "TRANSIENT".to_string(),
            FetchError::Auth(_) => "AUTH".to_string(),
            FetchError::Remote(e) => e.code(),
        }
    }
}

impl From<ApiError> for FetchError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::PermissionDenied(msg) => FetchError::PermissionDenied(msg),
            ApiError::NotFound(msg) => FetchError::NotFound(msg),
            ApiError::Unauthorized => FetchError::Auth(AuthError::TokenRejected),
            ApiError::Transient { message, .. } => FetchError::Transient {
                retries: 0,
                message,
            },
            other => FetchError::Remote(other),
        }
    }
}

/// Local storage failure
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage root is not a directory: {}", .0.display())]
    InvalidRoot(PathBuf),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        "STORAGE"
    }
}

/// Invalid run configuration, detected before a run starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("OAuth client id is required")]
    MissingClientId,

    #[error("OAuth client secret is required")]
    MissingClientSecret,

    #[error("A data folder to save messages to is required")]
    MissingDataFolder,

    #[error("Max connections must be at least 1")]
    InvalidMaxConnections,

    #[error("Invalid date '{0}', expected YYYY/MM/DD")]
    InvalidDate(String),

    #[error("Start date {start} is after end date {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Unknown provider '{0}', expected office365 or gmail")]
    UnknownProvider(String),
}

/// Run-fatal error returned by the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Listing aborted after {retries} retries: {message}")]
    Transient { retries: u32, message: String },

    #[error("Listing failed: {0}")]
    Remote(ApiError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        assert!(ApiError::transient("connection reset").is_transient());
        assert!(!ApiError::NotFound("m1".into()).is_transient());
        assert!(!ApiError::Unauthorized.is_transient());

        let throttled = ApiError::Transient {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_fetch_error_from_api_error() {
        assert!(matches!(
            FetchError::from(ApiError::PermissionDenied("nope".into())),
            FetchError::PermissionDenied(_)
        ));
        assert!(matches!(
            FetchError::from(ApiError::Unauthorized),
            FetchError::Auth(AuthError::TokenRejected)
        ));

        let err = FetchError::from(ApiError::Request {
            status: 400,
            message: "bad request".into(),
        });
        assert_eq!(err.code(), "400");
    }
}
