//! Release publishing.
//!
//! A release goes through `Unpublished → Created → Published`, or ends in
//! `PartiallyPublished` when some uploads fail, or `Failed` when the create
//! call itself is rejected. Creation is attempted exactly once; uploads fan
//! out over at most `max_in_flight` concurrent tasks and every outcome is
//! collected before returning.

use crate::build::BuildArtifact;
use crate::error::{Result, ShipyardError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument, warn};

/// Failure reported by the release-hosting collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum HostError {
    /// A release for the tag already exists.
    #[error("release already exists: {0}")]
    Duplicate(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    /// The asset name is already taken on the release.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

/// Everything the host needs to create a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDraft {
    pub owner: String,
    pub repo_name: String,
    pub version_tag: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
    pub prerelease: bool,
    /// Branch or commit the tag is created from when it does not exist yet.
    pub target_commitish: Option<String>,
}

/// Binary payload for one asset upload. The file handle lives only as long
/// as the upload.
#[derive(Debug)]
pub struct AssetPayload {
    pub file: tokio::fs::File,
    pub length: u64,
}

/// Remote release-hosting service.
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    /// Create the release record and return the id the host assigned.
    async fn create_release(&self, draft: &ReleaseDraft) -> std::result::Result<u64, HostError>;

    /// Attach `payload` to release `release_id` under `name`.
    async fn upload_asset(
        &self,
        release_id: u64,
        name: &str,
        payload: AssetPayload,
    ) -> std::result::Result<(), HostError>;
}

/// A release as known locally, joined to the remote by `remote_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub draft: ReleaseDraft,
    remote_id: Option<u64>,
}

impl ReleaseRecord {
    pub fn new(draft: ReleaseDraft) -> Self {
        Self {
            draft,
            remote_id: None,
        }
    }

    pub fn remote_id(&self) -> Option<u64> {
        self.remote_id
    }

    pub fn tag(&self) -> &str {
        &self.draft.version_tag
    }

    /// Record the id assigned by the host. Can only happen once.
    pub fn assign_remote_id(&mut self, id: u64) -> Result<()> {
        if let Some(existing) = self.remote_id {
            return Err(ShipyardError::RemoteIdAlreadySet {
                tag: self.draft.version_tag.clone(),
                remote_id: existing,
            });
        }
        self.remote_id = Some(id);
        Ok(())
    }
}

/// Lifecycle of one release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    Unpublished,
    Created,
    Published,
    PartiallyPublished,
    Failed,
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishState::Unpublished => "unpublished",
            PublishState::Created => "created",
            PublishState::Published => "published",
            PublishState::PartiallyPublished => "partially published",
            PublishState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of uploading one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub artifact: BuildArtifact,
    pub succeeded: bool,
    pub error: Option<HostError>,
}

impl UploadOutcome {
    pub fn asset_name(&self) -> String {
        self.artifact.file_name()
    }
}

/// Summary of a publish attempt.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub state: PublishState,
    pub record: ReleaseRecord,
    /// One per artifact, unordered.
    pub outcomes: Vec<UploadOutcome>,
}

impl PublishReport {
    /// Names of assets that failed to upload, sorted.
    pub fn failed_assets(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| !o.succeeded)
            .map(UploadOutcome::asset_name)
            .collect();
        names.sort();
        names
    }

    pub fn is_published(&self) -> bool {
        self.state == PublishState::Published
    }
}

/// Drives a [`ReleaseHost`] through one release lifecycle.
#[derive(Clone)]
pub struct ReleasePublisher {
    host: Arc<dyn ReleaseHost>,
    max_in_flight: usize,
}

impl ReleasePublisher {
    /// `max_in_flight` is clamped to at least one.
    pub fn new(host: Arc<dyn ReleaseHost>, max_in_flight: usize) -> Self {
        Self {
            host,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Create the remote release and stamp its id on `record`.
    ///
    /// One attempt only. A tag that already exists yields
    /// [`ShipyardError::DuplicateRelease`].
    #[instrument(skip(self, record), fields(tag = %record.tag()))]
    pub async fn create_release(&self, record: &mut ReleaseRecord) -> Result<u64> {
        if let Some(id) = record.remote_id() {
            return Err(ShipyardError::RemoteIdAlreadySet {
                tag: record.tag().to_string(),
                remote_id: id,
            });
        }

        let id = match self.host.create_release(&record.draft).await {
            Ok(id) => id,
            Err(HostError::Duplicate(_)) => {
                warn!(tag = %record.tag(), "release already exists");
                return Err(ShipyardError::DuplicateRelease {
                    tag: record.tag().to_string(),
                });
            }
            Err(e) => {
                warn!(tag = %record.tag(), error = %e, "release creation failed");
                return Err(ShipyardError::ReleaseCreateFailed {
                    tag: record.tag().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        record.assign_remote_id(id)?;
        info!(
            tag = %record.tag(),
            remote_id = id,
            repo = %format!("{}/{}", record.draft.owner, record.draft.repo_name),
            "created release"
        );
        Ok(id)
    }

    /// Upload every artifact to release `release_id`.
    ///
    /// Returns one outcome per artifact; a failed upload does not cancel
    /// the others.
    #[instrument(skip(self, artifacts), fields(assets = artifacts.len()))]
    pub async fn upload_assets(
        &self,
        release_id: u64,
        artifacts: &[BuildArtifact],
    ) -> Vec<UploadOutcome> {
        let total = artifacts.len();
        let outcomes: Arc<Mutex<Vec<UploadOutcome>>> =
            Arc::new(Mutex::new(Vec::with_capacity(total)));
        let completed = Arc::new(AtomicUsize::new(0));
        let sem = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = Vec::with_capacity(total);

        for artifact in artifacts.iter().cloned() {
            let host = Arc::clone(&self.host);
            let outcomes = Arc::clone(&outcomes);
            let completed = Arc::clone(&completed);
            let sem = Arc::clone(&sem);
            let task_artifact = artifact.clone();

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let name = task_artifact.file_name();
                let result = upload_one(host.as_ref(), release_id, &task_artifact, &name).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

                let outcome = match result {
                    Ok(()) => {
                        info!(asset = %name, progress = %format!("{done}/{total}"), "uploaded");
                        UploadOutcome {
                            artifact: task_artifact,
                            succeeded: true,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(
                            asset = %name,
                            error = %e,
                            progress = %format!("{done}/{total}"),
                            "upload failed"
                        );
                        UploadOutcome {
                            artifact: task_artifact,
                            succeeded: false,
                            error: Some(e),
                        }
                    }
                };
                outcomes.lock().await.push(outcome);
            });
            tasks.push((artifact, task));
        }

        for (artifact, task) in tasks {
            if let Err(e) = task.await {
                outcomes.lock().await.push(UploadOutcome {
                    artifact,
                    succeeded: false,
                    error: Some(HostError::Other(format!("upload task aborted: {e}"))),
                });
            }
        }

        let collected = std::mem::take(&mut *outcomes.lock().await);
        collected
    }

    /// Create the release, then upload every artifact.
    ///
    /// A failed create is returned as an error. Upload failures are not
    /// errors here; they leave the report in
    /// [`PublishState::PartiallyPublished`].
    pub async fn publish(
        &self,
        mut record: ReleaseRecord,
        artifacts: &[BuildArtifact],
    ) -> Result<PublishReport> {
        let id = self.create_release(&mut record).await?;
        let outcomes = self.upload_assets(id, artifacts).await;

        let state = if outcomes.iter().all(|o| o.succeeded) {
            PublishState::Published
        } else {
            PublishState::PartiallyPublished
        };
        let report = PublishReport {
            state,
            record,
            outcomes,
        };
        if report.is_published() {
            info!(tag = %report.record.tag(), assets = artifacts.len(), "release published");
        } else {
            warn!(
                tag = %report.record.tag(),
                failed = ?report.failed_assets(),
                "release is missing assets"
            );
        }
        Ok(report)
    }
}

async fn upload_one(
    host: &dyn ReleaseHost,
    release_id: u64,
    artifact: &BuildArtifact,
    name: &str,
) -> std::result::Result<(), HostError> {
    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|e| HostError::Other(format!("cannot open {}: {e}", artifact.path.display())))?;
    let length = file
        .metadata()
        .await
        .map_err(|e| HostError::Other(format!("cannot stat {}: {e}", artifact.path.display())))?
        .len();
    host.upload_asset(release_id, name, AssetPayload { file, length })
        .await
}
