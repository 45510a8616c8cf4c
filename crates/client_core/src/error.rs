use std::time::Duration;

use shared::error::ApiError;
use thiserror::Error;

/// Failure of a credential-refresh exchange, as seen by every caller that
/// was waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh exchange rejected by backend (status {status})")]
    Rejected { status: u16 },
    #[error("refresh exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("refresh exchange failed: {0}")]
    Exchange(String),
    #[error("no refresh token stored")]
    NoCredential,
    #[error("session ended while the refresh was pending")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The request was rejected again after its single retry with a
    /// refreshed credential.
    #[error("credential rejected after refresh")]
    AuthExpired,
    #[error("credential refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),
    #[error("no credential available, log in first")]
    NotAuthenticated,
    #[error("session is closed")]
    Closed,
    #[error("http transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {}", .error.as_ref().map(|e| e.message.as_str()).unwrap_or("no error body"))]
    Http {
        status: u16,
        error: Option<ApiError>,
    },
    #[error(transparent)]
    Credentials(#[from] CredentialStoreError),
}

/// Realtime connection failures. Only `Unauthorized` has a credential cause.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("realtime handshake rejected the credential: {0}")]
    Unauthorized(String),
    #[error("realtime connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("realtime transport failed: {0}")]
    Io(String),
    #[error("realtime connection closed by peer")]
    Closed,
}

/// An inbound frame that could not be turned into a typed event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed or unknown realtime frame: {0}")]
    Malformed(String),
    #[error("`{event}` received before identity confirmation")]
    Unidentified { event: &'static str },
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("failed to access credential file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
