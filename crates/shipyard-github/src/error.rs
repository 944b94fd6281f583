//! Error types for the GitHub client

use shipyard_core::HostError;
use thiserror::Error;

/// Errors returned by [`crate::GitHubClient`].
#[derive(Error, Debug)]
pub enum GitHubError {
    /// The token environment variable is unset or empty
    #[error("GitHub token not found in environment variable {0}")]
    MissingToken(String),

    /// GitHub rejected the credentials (401/403)
    #[error("GitHub rejected the credentials: {0}")]
    Unauthorized(String),

    /// The release or asset already exists (422 `already_exists`)
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Any other non-success status
    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport failure (connect, TLS, timeout)
    #[error("HTTP error: {0}")]
    Http(String),

    /// A success response that could not be decoded
    #[error("unexpected response from GitHub: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GitHubError {
    fn from(err: reqwest::Error) -> Self {
        GitHubError::Http(err.to_string())
    }
}

impl GitHubError {
    /// Map to the host error taxonomy for a create call.
    pub fn into_create_error(self) -> HostError {
        match self {
            GitHubError::AlreadyExists(msg) => HostError::Duplicate(msg),
            other => other.into_common(),
        }
    }

    /// Map to the host error taxonomy for an upload call.
    pub fn into_upload_error(self) -> HostError {
        match self {
            GitHubError::AlreadyExists(msg) => HostError::Conflict(msg),
            other => other.into_common(),
        }
    }

    fn into_common(self) -> HostError {
        match self {
            GitHubError::MissingToken(_) | GitHubError::Unauthorized(_) => {
                HostError::Auth(self.to_string())
            }
            GitHubError::Http(msg) => HostError::Network(msg),
            GitHubError::Api { status, .. } if status >= 500 => {
                HostError::Network(self.to_string())
            }
            other => HostError::Other(other.to_string()),
        }
    }
}

/// Result type for GitHub operations
pub type Result<T> = std::result::Result<T, GitHubError>;
