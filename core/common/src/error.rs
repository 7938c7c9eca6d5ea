//! Common error types for LexiSync.

use thiserror::Error;

/// Top-level error type for LexiSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The interactive consent flow failed before producing a token.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The user closed the consent surface without completing it.
    #[error("Authentication cancelled by user")]
    AuthenticationCancelled,

    /// A refresh was requested but no refresh token is held.
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The provider rejected the refresh token (revoked or expired grant).
    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),

    /// A remote operation was attempted without a valid session.
    #[error("Not authenticated with Google Drive")]
    NotAuthenticated,

    /// A provider-level failure during a remote file operation.
    #[error("{message}: {source}")]
    RemoteOperationFailed {
        message: String,
        #[source]
        source: Box<Error>,
    },

    /// Network or transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Access to the resource was denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Wrap a provider failure with an operation-specific message.
    pub fn remote(message: impl Into<String>, source: Error) -> Self {
        Error::RemoteOperationFailed {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error means the session must go through consent again.
    ///
    /// Looks through `RemoteOperationFailed` to the provider failure.
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            Error::NotAuthenticated | Error::NoRefreshToken | Error::RefreshRejected(_) => true,
            Error::RemoteOperationFailed { source, .. } => source.requires_reauthentication(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
