//! Core error types for fieldbridge-core.
//!
//! Errors are grouped per concern with thiserror; [`CoreError`] is the
//! umbrella type returned by operations that cross several of them.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for fieldbridge-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// OAuth token lifecycle errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Classified remote API failures
    #[error("Remote API error: {0}")]
    Api(#[from] ApiError),

    /// Malformed mapping configuration
    #[error("Transformation error: {0}")]
    Transform(#[from] TransformError),

    /// Record source failures
    #[error("Record source error: {0}")]
    Source(#[from] SourceError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Stored value could not be decoded
    #[error("Corrupt value for '{key}': {message}")]
    Corrupt { key: String, message: String },

    /// Database is locked
    #[error("Database is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Missing required configuration key
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),

    /// No configuration for a record type
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),
}

/// OAuth-specific errors.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// Credentials not configured
    #[error("OAuth client credentials are not configured")]
    CredentialsNotConfigured,

    /// The token endpoint rejected the grant
    #[error("Token exchange rejected ({status}): {message}")]
    TokenRejected { status: u16, message: String },

    /// Refresh-token grant failed and re-authentication also failed
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// The token endpoint answered with something that is not a token
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// The token endpoint could not be reached
    #[error("Token endpoint unreachable: {0}")]
    Network(String),

    /// A previous authentication failure has halted the integration
    #[error("Integration halted after authentication failure: {0}")]
    Blocked(String),
}

impl AuthError {
    /// Whether this failure is about connectivity rather than credentials.
    pub fn is_network(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }

    /// Whether the token endpoint failed for reasons other than the credentials:
    /// unreachable, overloaded, or down.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network(_) => true,
            AuthError::TokenRejected { status, .. } => matches!(*status, 408 | 429) || *status >= 500,
            _ => false,
        }
    }
}

/// Classification used by the orchestrator to decide whether to re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    Authentication,
    Transient,
    Permanent,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::Authentication => "authentication",
            ApiErrorKind::Transient => "transient",
            ApiErrorKind::Permanent => "permanent",
        }
    }
}

/// A failed remote call.
#[derive(Error, Debug, Clone)]
#[error("{} failure{}: {message}", .kind.as_str(), .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// HTTP status, when the server answered at all.
    pub status: Option<u16>,
    /// Remote error body, verbatim.
    pub body: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Authentication,
            status: None,
            body: None,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transient,
            status: None,
            body: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Permanent,
            status: None,
            body: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        if !body.is_empty() {
            self.body = Some(body);
        }
        self
    }

    /// Classify an HTTP status the remote answered with.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ApiErrorKind::Authentication,
            408 | 429 => ApiErrorKind::Transient,
            s if s >= 500 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Permanent,
        };
        Self {
            kind,
            status: Some(status),
            body: None,
            message: format!("remote answered HTTP {status}"),
        }
        .with_body(body)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ApiErrorKind::Transient
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        if err.is_transient() {
            let api = ApiError::transient(err.to_string());
            match err {
                AuthError::TokenRejected { status, .. } => api.with_status(status),
                _ => api,
            }
        } else {
            ApiError::authentication(err.to_string())
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ApiError::transient(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), String::new())
        } else {
            ApiError::transient(err.to_string())
        }
    }
}

/// Malformed mapping configuration detected while building a payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Mapping for '{local_key}' has malformed parameter '{param}': {message}")]
    MalformedMapping {
        local_key: String,
        param: String,
        message: String,
    },

    #[error("Mapping for '{0}' has an empty remote field")]
    EmptyRemoteField(String),
}

impl TransformError {
    /// Local key of the mapping at fault.
    pub fn local_key(&self) -> &str {
        match self {
            TransformError::MalformedMapping { local_key, .. } => local_key,
            TransformError::EmptyRemoteField(key) => key,
        }
    }
}

/// Record source errors.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read records from {path}: {message}")]
    ReadFailed { path: PathBuf, message: String },

    #[error("Record {0} not found")]
    NotFound(u64),
}

/// Validation errors for administrative input.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Duplicate key in one submitted set
    #[error("Duplicate local key '{0}' in mapping set")]
    DuplicateKey(String),

    /// Empty collection
    #[error("Empty value: {0}")]
    Empty(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ApiError::from_status(401, "").kind, ApiErrorKind::Authentication);
        assert_eq!(ApiError::from_status(503, "").kind, ApiErrorKind::Transient);
        assert_eq!(ApiError::from_status(429, "").kind, ApiErrorKind::Transient);
        assert_eq!(ApiError::from_status(400, "bad field").kind, ApiErrorKind::Permanent);
        assert_eq!(ApiError::from_status(400, "bad field").body.as_deref(), Some("bad field"));
        assert!(ApiError::from_status(400, "").body.is_none());
    }

    #[test]
    fn auth_network_errors_are_transient() {
        let api: ApiError = AuthError::Network("connection refused".into()).into();
        assert_eq!(api.kind, ApiErrorKind::Transient);

        let api: ApiError = AuthError::CredentialsNotConfigured.into();
        assert_eq!(api.kind, ApiErrorKind::Authentication);

        let api: ApiError = AuthError::TokenRejected { status: 503, message: "maintenance".into() }.into();
        assert_eq!(api.kind, ApiErrorKind::Transient);
        assert_eq!(api.status, Some(503));

        let api: ApiError = AuthError::TokenRejected { status: 400, message: "invalid_client".into() }.into();
        assert_eq!(api.kind, ApiErrorKind::Authentication);
    }

    #[test]
    fn api_error_display_includes_status() {
        let err = ApiError::from_status(500, "boom");
        assert!(err.to_string().contains("HTTP 500"));
    }
}
