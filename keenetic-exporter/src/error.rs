//! Error types for the router API client.

use thiserror::Error;

/// Errors raised while saving the cookie session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised while authenticating against the router.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The 401 response did not carry both challenge headers.
    #[error("Missing challenge or realm headers")]
    MissingChallenge,

    /// The initial auth check returned something other than 200 or 401.
    #[error("Failed to check authorisation, unexpected status {0}")]
    UnexpectedStatus(u16),

    /// The router refused the challenge response.
    #[error("Router authorisation failed, status {0}")]
    Rejected(u16),

    #[error("Router unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors raised by [`crate::client::KeeneticClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// Authentication did not complete.
    #[error("No router connection: {0}")]
    NoConnection(#[source] AuthError),

    /// The router answered a metric request with a non-200 status.
    #[error("API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid JSON in response: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// HTTP status of an API error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
