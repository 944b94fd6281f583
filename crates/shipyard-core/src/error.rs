//! Error taxonomy for the release engine.

use thiserror::Error;

/// Errors produced by the release engine.
///
/// Per-unit failures inside a fan-out stage (one platform build, one asset
/// upload) are carried as values in the stage report; these variants are what
/// a stage or the orchestrator surfaces once it has reached a terminal decision.
#[derive(Debug, Error)]
pub enum ShipyardError {
    /// Configuration failed validation before any stage ran.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Commit history could not be read.
    #[error("commit history unavailable: {0}")]
    HistoryUnavailable(String),

    /// A single commit record could not be interpreted.
    #[error("malformed commit record {hash}: {reason}")]
    MalformedCommitRecord { hash: String, reason: String },

    /// One or more platforms failed to compile.
    #[error("compilation failed for: {}", platforms.join(", "))]
    CompileFailed { platforms: Vec<String> },

    /// A before/after build hook exited unsuccessfully.
    #[error("build hook `{command}` failed: {output}")]
    HookFailed { command: String, output: String },

    /// The remote release record could not be created.
    #[error("release creation failed for {tag}: {reason}")]
    ReleaseCreateFailed { tag: String, reason: String },

    /// A release for this tag already exists remotely.
    #[error("release for tag {tag} already exists")]
    DuplicateRelease { tag: String },

    /// One or more assets could not be uploaded.
    #[error("asset upload failed for: {}", assets.join(", "))]
    AssetUploadFailed { assets: Vec<String> },

    /// The remote id was already assigned to this release record.
    #[error("release {tag} already has remote id {remote_id}")]
    RemoteIdAlreadySet { tag: String, remote_id: u64 },

    /// Configuration (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for ShipyardError {
    fn from(err: serde_yaml::Error) -> Self {
        ShipyardError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ShipyardError {
    fn from(err: serde_json::Error) -> Self {
        ShipyardError::Serialization(err.to_string())
    }
}

/// Result type for release engine operations.
pub type Result<T> = std::result::Result<T, ShipyardError>;
