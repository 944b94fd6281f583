//! In-memory collaborators for tests and dry runs.
//!
//! `ScriptedCompiler`, `MemoryReleaseHost` and `StaticCommitSource` satisfy
//! the collaborator traits without a toolchain, a network, or git.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::build::{CompileInvocation, CompileOutput, Compiler};
use crate::error::{Result, ShipyardError};
use crate::history::{CommitSource, RawCommit};
use crate::platform::PlatformTarget;
use crate::publish::{AssetPayload, HostError, ReleaseDraft, ReleaseHost};

// ---------------------------------------------------------------------------
// ScriptedCompiler
// ---------------------------------------------------------------------------

/// Compiler that writes a small placeholder binary, or fails for the
/// platforms it was told to fail.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompiler {
    failing: HashSet<PlatformTarget>,
    delay: Option<Duration>,
    invocations: Arc<Mutex<Vec<CompileInvocation>>>,
}

impl ScriptedCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make compilation fail for every platform in `platforms`.
    pub fn failing(mut self, platforms: impl IntoIterator<Item = PlatformTarget>) -> Self {
        self.failing.extend(platforms);
        self
    }

    /// Sleep before answering each invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every invocation received so far, in arrival order.
    pub fn invocations(&self) -> Vec<CompileInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Compiler for ScriptedCompiler {
    async fn compile(&self, invocation: &CompileInvocation) -> Result<CompileOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.contains(&invocation.platform) {
            return Ok(CompileOutput {
                success: false,
                exit_code: 1,
                diagnostics: format!("simulated compile failure for {}", invocation.platform),
            });
        }

        let content = format!("{} binary", invocation.platform);
        tokio::fs::write(&invocation.output_path, content).await?;
        Ok(CompileOutput {
            success: true,
            exit_code: 0,
            diagnostics: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryReleaseHost
// ---------------------------------------------------------------------------

/// An asset received by [`MemoryReleaseHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub release_id: u64,
    pub name: String,
    pub length: u64,
    pub content: Vec<u8>,
}

/// Release host backed by in-memory maps.
///
/// Rejects a second release for the same tag with [`HostError::Duplicate`]
/// and a second asset with the same name on one release with
/// [`HostError::Conflict`].
#[derive(Debug)]
pub struct MemoryReleaseHost {
    next_id: AtomicU64,
    releases: Mutex<BTreeMap<u64, ReleaseDraft>>,
    uploads: Mutex<Vec<StoredAsset>>,
    create_error: Option<HostError>,
    failing_assets: HashMap<String, HostError>,
}

impl Default for MemoryReleaseHost {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            releases: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(Vec::new()),
            create_error: None,
            failing_assets: HashMap::new(),
        }
    }
}

impl MemoryReleaseHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every create call with `error`.
    pub fn rejecting_creates(mut self, error: HostError) -> Self {
        self.create_error = Some(error);
        self
    }

    /// Answer uploads of `name` with `error`.
    pub fn failing_asset(mut self, name: impl Into<String>, error: HostError) -> Self {
        self.failing_assets.insert(name.into(), error);
        self
    }

    pub fn release(&self, id: u64) -> Option<ReleaseDraft> {
        self.releases.lock().unwrap().get(&id).cloned()
    }

    /// All releases in creation order.
    pub fn releases(&self) -> Vec<ReleaseDraft> {
        self.releases.lock().unwrap().values().cloned().collect()
    }

    /// All accepted uploads in arrival order.
    pub fn uploads(&self) -> Vec<StoredAsset> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReleaseHost for MemoryReleaseHost {
    async fn create_release(&self, draft: &ReleaseDraft) -> std::result::Result<u64, HostError> {
        if let Some(err) = &self.create_error {
            return Err(err.clone());
        }
        let mut releases = self.releases.lock().unwrap();
        let duplicate = releases.values().any(|r| {
            r.owner == draft.owner
                && r.repo_name == draft.repo_name
                && r.version_tag == draft.version_tag
        });
        if duplicate {
            return Err(HostError::Duplicate(format!(
                "tag {} already has a release",
                draft.version_tag
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        releases.insert(id, draft.clone());
        Ok(id)
    }

    async fn upload_asset(
        &self,
        release_id: u64,
        name: &str,
        mut payload: AssetPayload,
    ) -> std::result::Result<(), HostError> {
        if !self.releases.lock().unwrap().contains_key(&release_id) {
            return Err(HostError::Other(format!("release {release_id} not found")));
        }
        if let Some(err) = self.failing_assets.get(name) {
            return Err(err.clone());
        }

        let mut content = Vec::new();
        payload
            .file
            .read_to_end(&mut content)
            .await
            .map_err(|e| HostError::Network(e.to_string()))?;

        let mut uploads = self.uploads.lock().unwrap();
        if uploads
            .iter()
            .any(|u| u.release_id == release_id && u.name == name)
        {
            return Err(HostError::Conflict(format!("asset {name} already exists")));
        }
        uploads.push(StoredAsset {
            release_id,
            name: name.to_string(),
            length: payload.length,
            content,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticCommitSource
// ---------------------------------------------------------------------------

/// Commit source that serves a fixed list of commits.
#[derive(Debug, Clone)]
pub struct StaticCommitSource {
    commits: Vec<RawCommit>,
    reference: Option<String>,
    head: String,
    unavailable: bool,
}

impl StaticCommitSource {
    pub fn new(commits: Vec<RawCommit>) -> Self {
        let head = commits
            .first()
            .map(|c| c.hash.clone())
            .unwrap_or_else(|| "0000000".to_string());
        Self {
            commits,
            reference: None,
            head,
            unavailable: false,
        }
    }

    pub fn with_reference(mut self, tag: impl Into<String>) -> Self {
        self.reference = Some(tag.into());
        self
    }

    /// Fail every call with [`ShipyardError::HistoryUnavailable`].
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(Vec::new())
        }
    }

    fn check(&self) -> Result<()> {
        if self.unavailable {
            return Err(ShipyardError::HistoryUnavailable(
                "history source offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CommitSource for StaticCommitSource {
    async fn last_reference(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.reference.clone())
    }

    async fn commits_since(&self, _since: Option<&str>) -> Result<Vec<RawCommit>> {
        self.check()?;
        Ok(self.commits.clone())
    }

    async fn head_commit(&self) -> Result<String> {
        self.check()?;
        Ok(self.head.clone())
    }
}
