//! Release orchestration.
//!
//! [`ReleaseOrchestrator::run`] sequences changelog → build → publish and
//! stops at the first stage that fails. Whatever happened is returned as a
//! single [`ReleaseReport`] naming the failed stage together with every
//! failed platform and asset.

use crate::build::{
    run_hooks, BuildArtifact, BuildCoordinator, BuildParams, BuildReport, Compiler,
};
use crate::changelog::{self, Changelog};
use crate::config::{expand_link_flags, is_valid_version, LinkFlagValues, ShipyardConfig};
use crate::error::{Result, ShipyardError};
use crate::history::{CommitSource, RawCommit};
use crate::platform::default_matrix;
use crate::publish::{
    PublishReport, PublishState, ReleaseDraft, ReleaseHost, ReleasePublisher, ReleaseRecord,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Whether the changelog stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangelogMode {
    /// Follow `release.changelog.enabled`; unreadable history is skipped.
    #[default]
    Auto,
    /// Always run; unreadable history fails the release.
    Required,
    Skip,
}

/// Parameters of one release invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub tag: String,
    /// `github.com/<owner>/<repo>`; falls back to `github.defaultRepo`.
    pub repo: Option<String>,
    /// Defaults to the tag.
    pub title: Option<String>,
    pub draft: bool,
    pub prerelease: bool,
    pub changelog: ChangelogMode,
    /// Run changelog and build, skip publishing.
    pub dry_run: bool,
}

impl ReleaseRequest {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            repo: None,
            title: None,
            draft: false,
            prerelease: false,
            changelog: ChangelogMode::Auto,
            dry_run: false,
        }
    }
}

/// Owner and name of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Parse `github.com/<owner>/<repo>`, with or without a scheme or `.git`.
pub fn parse_repo_ref(text: &str) -> Result<RepoRef> {
    let trimmed = text
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let parts: Vec<&str> = trimmed.split('/').collect();
    match parts.as_slice() {
        ["github.com", owner, name] if !owner.is_empty() && !name.is_empty() => Ok(RepoRef {
            owner: owner.to_string(),
            name: name.to_string(),
        }),
        _ => Err(ShipyardError::ConfigInvalid(format!(
            "invalid repository reference: {text} (expected github.com/<owner>/<repo>)"
        ))),
    }
}

/// Pipeline stage, for failure reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Config,
    Changelog,
    Build,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Config => "config",
            Stage::Changelog => "changelog",
            Stage::Build => "build",
            Stage::Publish => "publish",
        };
        f.write_str(s)
    }
}

/// The stage that stopped the release and why.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: ShipyardError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}

/// What the changelog stage wrote.
#[derive(Debug, Clone)]
pub struct ChangelogOutcome {
    pub path: PathBuf,
    pub changelog: Changelog,
    /// The section prepended to the file, in the configured format. `None`
    /// when the file already recorded this version and was left as is.
    pub rendered: Option<String>,
}

/// Outcome of one release invocation.
#[derive(Debug)]
pub struct ReleaseReport {
    pub tag: String,
    pub dry_run: bool,
    pub changelog: Option<ChangelogOutcome>,
    pub build: Option<BuildReport>,
    pub publish: Option<PublishReport>,
    pub failure: Option<StageFailure>,
}

impl ReleaseReport {
    fn new(request: &ReleaseRequest) -> Self {
        Self {
            tag: request.tag.clone(),
            dry_run: request.dry_run,
            changelog: None,
            build: None,
            publish: None,
            failure: None,
        }
    }

    fn fail(mut self, stage: Stage, error: ShipyardError) -> Self {
        warn!(stage = %stage, error = %error, "release stopped");
        self.failure = Some(StageFailure { stage, error });
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Where the remote release ended up.
    pub fn state(&self) -> PublishState {
        match (&self.publish, &self.failure) {
            (Some(publish), _) => publish.state,
            (None, Some(f)) if f.stage == Stage::Publish => PublishState::Failed,
            _ => PublishState::Unpublished,
        }
    }

    pub fn failed_platforms(&self) -> Vec<String> {
        self.build
            .as_ref()
            .map(BuildReport::failed_platforms)
            .unwrap_or_default()
    }

    pub fn failed_assets(&self) -> Vec<String> {
        self.publish
            .as_ref()
            .map(PublishReport::failed_assets)
            .unwrap_or_default()
    }

    /// Human-readable summary, one fact per line.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        match &self.failure {
            None if self.dry_run => {
                out.push_str(&format!("Dry run for {} completed\n", self.tag));
            }
            None => out.push_str(&format!("Released {}\n", self.tag)),
            Some(failure) => out.push_str(&format!("Release {} failed: {failure}\n", self.tag)),
        }
        if let Some(changelog) = &self.changelog {
            out.push_str(&format!(
                "Changelog: {} entries written to {}\n",
                changelog.changelog.entry_count(),
                changelog.path.display()
            ));
        }
        if let Some(build) = &self.build {
            out.push_str(&format!("Built: {} artifact(s)\n", build.artifacts.len()));
            for failure in &build.failures {
                out.push_str(&format!("Failed platform: {}\n", failure.platform));
            }
        }
        if let Some(publish) = &self.publish {
            out.push_str(&format!("Release state: {}\n", publish.state));
            for name in publish.failed_assets() {
                out.push_str(&format!("Failed asset: {name}\n"));
            }
        }
        out
    }

    /// Machine-readable summary.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "tag": self.tag,
            "dry_run": self.dry_run,
            "success": self.is_success(),
            "state": self.state(),
            "failed_stage": self.failure.as_ref().map(|f| f.stage),
            "error": self.failure.as_ref().map(|f| f.error.to_string()),
            "changelog_entries": self.changelog.as_ref().map(|c| c.changelog.entry_count()),
            "artifacts": self.build.as_ref().map(|b| &b.artifacts),
            "failed_platforms": self.failed_platforms(),
            "failed_assets": self.failed_assets(),
            "remote_id": self.publish.as_ref().and_then(|p| p.record.remote_id()),
        })
    }
}

/// Runs the release pipeline against injected collaborators.
pub struct ReleaseOrchestrator {
    config: ShipyardConfig,
    workdir: PathBuf,
    commits: Arc<dyn CommitSource>,
    compiler: Arc<dyn Compiler>,
    host: Option<Arc<dyn ReleaseHost>>,
}

impl ReleaseOrchestrator {
    pub fn new(
        config: ShipyardConfig,
        commits: Arc<dyn CommitSource>,
        compiler: Arc<dyn Compiler>,
    ) -> Self {
        Self {
            config,
            workdir: PathBuf::from("."),
            commits,
            compiler,
            host: None,
        }
    }

    /// Directory that relative paths and hooks resolve against.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Release host used by the publish stage.
    pub fn with_host(mut self, host: Arc<dyn ReleaseHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn config(&self) -> &ShipyardConfig {
        &self.config
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    /// Run the full pipeline for `request`.
    #[instrument(skip(self, request), fields(tag = %request.tag, dry_run = request.dry_run))]
    pub async fn run(&self, request: &ReleaseRequest) -> ReleaseReport {
        let mut report = ReleaseReport::new(request);

        let target = match self.preflight(request) {
            Ok(target) => target,
            Err(e) => return report.fail(Stage::Config, e),
        };

        match self.generate_changelog(&request.tag, request.changelog).await {
            Ok(outcome) => report.changelog = outcome,
            Err(e) => return report.fail(Stage::Changelog, e),
        }

        let build = match self.build(&request.tag).await {
            Ok(build) => build,
            Err(e) => return report.fail(Stage::Build, e),
        };
        let build_failed = (!build.is_success()).then(|| ShipyardError::CompileFailed {
            platforms: build.failed_platforms(),
        });
        report.build = Some(build);
        if let Some(e) = build_failed {
            return report.fail(Stage::Build, e);
        }

        let Some((repo, host)) = target else {
            info!(tag = %request.tag, "dry run; skipping publish");
            return report;
        };

        let body = release_body(
            report.changelog.as_ref().map(|c| &c.changelog),
            report.build.as_ref().map(|b| b.artifacts.as_slice()).unwrap_or_default(),
        );
        let record = ReleaseRecord::new(ReleaseDraft {
            owner: repo.owner,
            repo_name: repo.name,
            version_tag: request.tag.clone(),
            title: request.title.clone().unwrap_or_else(|| request.tag.clone()),
            body,
            draft: request.draft,
            prerelease: request.prerelease,
            target_commitish: Some(self.config.release.default_branch.clone()),
        });

        let publisher = ReleasePublisher::new(host, self.config.github.max_concurrent_uploads);
        let artifacts = report
            .build
            .as_ref()
            .map(|b| b.artifacts.clone())
            .unwrap_or_default();
        let publish = match publisher.publish(record, &artifacts).await {
            Ok(publish) => publish,
            Err(e) => return report.fail(Stage::Publish, e),
        };
        let failed_assets = publish.failed_assets();
        report.publish = Some(publish);
        if !failed_assets.is_empty() {
            return report.fail(
                Stage::Publish,
                ShipyardError::AssetUploadFailed {
                    assets: failed_assets,
                },
            );
        }

        info!(tag = %request.tag, "release complete");
        report
    }

    /// Validate inputs before any stage runs. Returns the publish target,
    /// or `None` for a dry run.
    fn preflight(
        &self,
        request: &ReleaseRequest,
    ) -> Result<Option<(RepoRef, Arc<dyn ReleaseHost>)>> {
        self.config.validate()?;
        if !is_valid_version(&request.tag) {
            return Err(ShipyardError::ConfigInvalid(format!(
                "invalid version tag: {}",
                request.tag
            )));
        }
        if request.dry_run {
            return Ok(None);
        }

        let repo = request
            .repo
            .as_deref()
            .or(self.config.github.default_repo.as_deref())
            .ok_or_else(|| {
                ShipyardError::ConfigInvalid(
                    "no repository given and github.defaultRepo is not set".to_string(),
                )
            })?;
        let repo = parse_repo_ref(repo)?;
        let host = self.host.clone().ok_or_else(|| {
            ShipyardError::ConfigInvalid("no release host configured".to_string())
        })?;
        Ok(Some((repo, host)))
    }

    /// Compile the changelog for `version` and prepend it to the configured
    /// file. Returns `None` when the stage is disabled or skipped.
    #[instrument(skip(self))]
    pub async fn generate_changelog(
        &self,
        version: &str,
        mode: ChangelogMode,
    ) -> Result<Option<ChangelogOutcome>> {
        let settings = &self.config.release.changelog;
        let enabled = match mode {
            ChangelogMode::Skip => false,
            ChangelogMode::Required => true,
            ChangelogMode::Auto => settings.enabled,
        };
        if !enabled {
            return Ok(None);
        }

        let commits = match self.read_history().await {
            Ok(commits) => commits,
            Err(e @ ShipyardError::HistoryUnavailable(_)) if mode == ChangelogMode::Auto => {
                warn!(error = %e, "skipping changelog");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut compiled = changelog::compile(&commits, version);
        let path = self.resolve(&settings.path);
        let rendered = changelog::update_file(&mut compiled, &path, settings.format).await?;
        Ok(Some(ChangelogOutcome {
            path,
            changelog: compiled,
            rendered,
        }))
    }

    async fn read_history(&self) -> Result<Vec<RawCommit>> {
        let since = self.commits.last_reference().await?;
        info!(since = since.as_deref().unwrap_or("<root>"), "reading commit history");
        self.commits.commits_since(since.as_deref()).await
    }

    /// Run hooks and build every configured platform into
    /// `output_dir/<version>`.
    ///
    /// Platform failures are in the report, not the error. After-hooks run
    /// only when every platform built.
    #[instrument(skip(self))]
    pub async fn build(&self, version: &str) -> Result<BuildReport> {
        let build = &self.config.build;
        run_hooks(&build.before, &self.workdir).await?;

        let link_flags = if build.ldflags.is_empty() {
            String::new()
        } else {
            let commit = if build.ldflags.contains("{commit}") {
                self.commits.head_commit().await?
            } else {
                String::new()
            };
            let values = LinkFlagValues {
                version: version.to_string(),
                commit,
                date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            };
            expand_link_flags(&build.ldflags, &values)?
        };

        let params = BuildParams {
            project_name: self.config.project.name.clone(),
            main_entry: build.main_file.clone(),
            output_dir: self.resolve(&build.output_dir),
            link_flags,
            extra_env: build.env.clone(),
            timeout: (build.timeout_secs > 0).then(|| Duration::from_secs(build.timeout_secs)),
        };
        let matrix = if build.platforms.is_empty() {
            default_matrix()
        } else {
            build.platforms.clone()
        };

        let coordinator = BuildCoordinator::new(Arc::clone(&self.compiler));
        let report = coordinator.build_all(&matrix, &params, version).await?;
        if report.is_success() {
            run_hooks(&build.after, &self.workdir).await?;
        }
        Ok(report)
    }
}

/// Release notes: the changelog section followed by artifact checksums.
pub fn release_body(
    changelog: Option<&Changelog>,
    artifacts: &[BuildArtifact],
) -> String {
    let mut body = match changelog {
        Some(changelog) if !changelog.is_empty() => changelog.to_markdown(),
        _ => String::new(),
    };
    if artifacts.is_empty() {
        return body;
    }

    let mut sorted: Vec<&BuildArtifact> = artifacts.iter().collect();
    sorted.sort_by_key(|a| a.file_name());

    if !body.is_empty() {
        body.push('\n');
    }
    body.push_str("## Checksums\n\n```\n");
    for artifact in sorted {
        body.push_str(&format!("{}  {}\n", artifact.sha256, artifact.file_name()));
    }
    body.push_str("```\n");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryReleaseHost, ScriptedCompiler, StaticCommitSource};
    use crate::platform::PlatformTarget;

    #[test]
    fn parses_repo_references() {
        let repo = parse_repo_ref("github.com/acme/tool").unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "tool");
        assert_eq!(repo.to_string(), "acme/tool");

        let repo = parse_repo_ref("https://github.com/acme/tool.git/").unwrap();
        assert_eq!(repo.name, "tool");

        for bad in ["acme/tool", "github.com/acme", "gitlab.com/acme/tool", "github.com//x"] {
            assert!(
                matches!(parse_repo_ref(bad), Err(ShipyardError::ConfigInvalid(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn release_body_lists_checksums_by_name() {
        let artifacts = vec![
            BuildArtifact {
                platform: PlatformTarget::new("windows", "amd64"),
                path: PathBuf::from("dist/v1/tool_windows_amd64.exe"),
                size_bytes: 1,
                sha256: "bb".to_string(),
            },
            BuildArtifact {
                platform: PlatformTarget::new("darwin", "arm64"),
                path: PathBuf::from("dist/v1/tool_darwin_arm64"),
                size_bytes: 1,
                sha256: "aa".to_string(),
            },
        ];
        let body = release_body(None, &artifacts);
        assert_eq!(
            body,
            "## Checksums\n\n```\naa  tool_darwin_arm64\nbb  tool_windows_amd64.exe\n```\n"
        );
    }

    fn orchestrator(dir: &Path, compiler: ScriptedCompiler) -> ReleaseOrchestrator {
        let mut config = ShipyardConfig::for_project("tool");
        config.build.platforms = vec![PlatformTarget::new("linux", "amd64")];
        config.github.default_repo = Some("github.com/acme/tool".to_string());
        ReleaseOrchestrator::new(
            config,
            Arc::new(StaticCommitSource::unavailable()),
            Arc::new(compiler),
        )
        .with_workdir(dir)
    }

    #[tokio::test]
    async fn invalid_tag_fails_before_any_stage() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = ScriptedCompiler::new();
        let orchestrator = orchestrator(dir.path(), compiler.clone())
            .with_host(Arc::new(MemoryReleaseHost::new()));

        let report = orchestrator.run(&ReleaseRequest::new("latest")).await;

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::Config);
        assert!(compiler.invocations().is_empty());
        assert_eq!(report.state(), PublishState::Unpublished);
    }

    #[tokio::test]
    async fn missing_host_is_a_config_error_unless_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), ScriptedCompiler::new());

        let report = orchestrator.run(&ReleaseRequest::new("v1.0.0")).await;
        assert_eq!(report.failure.as_ref().unwrap().stage, Stage::Config);

        let mut request = ReleaseRequest::new("v1.0.0");
        request.dry_run = true;
        let report = orchestrator.run(&request).await;
        assert!(report.is_success(), "{}", report.render_text());
        assert_eq!(report.build.as_ref().unwrap().artifacts.len(), 1);
        assert!(report.publish.is_none());
        assert!(report.render_text().starts_with("Dry run for v1.0.0"));
    }

    #[tokio::test]
    async fn optional_changelog_is_skipped_when_history_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), ScriptedCompiler::new());

        let outcome = orchestrator
            .generate_changelog("v1.0.0", ChangelogMode::Auto)
            .await
            .unwrap();
        assert!(outcome.is_none());

        let err = orchestrator
            .generate_changelog("v1.0.0", ChangelogMode::Required)
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::HistoryUnavailable(_)));
    }

    #[tokio::test]
    async fn required_changelog_failure_stops_before_build() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = ScriptedCompiler::new();
        let orchestrator = orchestrator(dir.path(), compiler.clone())
            .with_host(Arc::new(MemoryReleaseHost::new()));
        let mut request = ReleaseRequest::new("v1.0.0");
        request.changelog = ChangelogMode::Required;

        let report = orchestrator.run(&request).await;

        assert_eq!(report.failure.as_ref().unwrap().stage, Stage::Changelog);
        assert!(report.build.is_none());
        assert!(compiler.invocations().is_empty());
    }

    #[tokio::test]
    async fn failing_before_hook_stops_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = ScriptedCompiler::new();
        let mut orchestrator = orchestrator(dir.path(), compiler.clone());
        orchestrator.config.build.before = vec!["exit 1".to_string()];

        let err = orchestrator.build("v1.0.0").await.unwrap_err();
        assert!(matches!(err, ShipyardError::HookFailed { .. }));
        assert!(compiler.invocations().is_empty());
    }

    #[tokio::test]
    async fn link_flags_are_expanded_for_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = ScriptedCompiler::new();
        let mut orchestrator = orchestrator(dir.path(), compiler.clone());
        orchestrator.config.build.ldflags = "-X main.version={version}".to_string();
        orchestrator.config.build.after = vec!["touch built".to_string()];

        let report = orchestrator.build("v1.2.3").await.unwrap();

        assert!(report.is_success());
        assert_eq!(
            compiler.invocations()[0].link_flags.as_deref(),
            Some("-X main.version=v1.2.3")
        );
        assert!(dir.path().join("built").exists());
        assert!(dir.path().join("dist/v1.2.3/tool_linux_amd64").exists());
    }
}
