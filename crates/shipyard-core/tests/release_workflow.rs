//! End-to-end release runs against the in-memory collaborators.

use std::path::Path;
use std::sync::Arc;

use shipyard_core::fakes::{MemoryReleaseHost, ScriptedCompiler, StaticCommitSource};
use shipyard_core::{
    ChangeKind, ChangelogMode, HostError, PlatformTarget, PublishState, RawCommit,
    ReleaseOrchestrator, ReleaseRequest, ShipyardConfig, ShipyardError, Stage,
};

fn commit(hash: &str, author: &str, minute: u32, message: &str) -> RawCommit {
    RawCommit {
        hash: hash.to_string(),
        author: author.to_string(),
        timestamp: format!("2026-05-01T10:{minute:02}:00+00:00"),
        message: message.to_string(),
    }
}

fn sample_history() -> Vec<RawCommit> {
    vec![
        commit("c3c3c3c3c3c3c3c3", "carol", 3, "bad message no colon"),
        commit("b2b2b2b2b2b2b2b2", "bob", 2, "fix: b"),
        commit("a1a1a1a1a1a1a1a1", "alice", 1, "feat(x): a"),
    ]
}

fn config(platforms: Vec<PlatformTarget>) -> ShipyardConfig {
    let mut config = ShipyardConfig::for_project("tool");
    config.build.platforms = platforms;
    config.github.default_repo = Some("github.com/acme/tool".to_string());
    config
}

fn orchestrator(
    dir: &Path,
    config: ShipyardConfig,
    commits: StaticCommitSource,
    compiler: ScriptedCompiler,
    host: Arc<MemoryReleaseHost>,
) -> ReleaseOrchestrator {
    ReleaseOrchestrator::new(config, Arc::new(commits), Arc::new(compiler))
        .with_workdir(dir)
        .with_host(host)
}

#[tokio::test]
async fn two_platforms_publish_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryReleaseHost::new());
    let platforms = vec![
        PlatformTarget::new("linux", "amd64"),
        PlatformTarget::new("darwin", "arm64"),
    ];
    let orchestrator = orchestrator(
        dir.path(),
        config(platforms),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new(),
        host.clone(),
    );

    let report = orchestrator.run(&ReleaseRequest::new("v1.0.0")).await;

    assert!(report.is_success(), "{}", report.render_text());
    assert_eq!(report.state(), PublishState::Published);
    assert_eq!(report.build.as_ref().unwrap().artifacts.len(), 2);
    let publish = report.publish.as_ref().unwrap();
    assert_eq!(publish.outcomes.len(), 2);
    assert!(publish.outcomes.iter().all(|o| o.succeeded));

    let releases = host.releases();
    assert_eq!(releases.len(), 1);
    let release = &releases[0];
    assert_eq!(release.owner, "acme");
    assert_eq!(release.repo_name, "tool");
    assert_eq!(release.title, "v1.0.0");
    assert_eq!(release.target_commitish.as_deref(), Some("main"));
    assert!(release.body.contains("## Features"));
    assert!(release.body.contains("tool_darwin_arm64"));

    let mut names: Vec<String> = host.uploads().into_iter().map(|u| u.name).collect();
    names.sort();
    assert_eq!(names, vec!["tool_darwin_arm64", "tool_linux_amd64"]);
    assert_eq!(publish.record.remote_id(), Some(1));
}

#[tokio::test]
async fn failing_platforms_stop_the_release_before_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryReleaseHost::new());
    let matrix = shipyard_core::default_matrix();
    let failing = vec![
        PlatformTarget::new("windows", "arm64"),
        PlatformTarget::new("linux", "arm64"),
    ];
    let orchestrator = orchestrator(
        dir.path(),
        config(matrix.clone()),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new().failing(failing.clone()),
        host.clone(),
    );

    let report = orchestrator.run(&ReleaseRequest::new("v1.1.0")).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Build);
    assert!(matches!(failure.error, ShipyardError::CompileFailed { .. }));
    let build = report.build.as_ref().unwrap();
    assert_eq!(build.artifacts.len(), matrix.len() - failing.len());
    assert_eq!(build.failures.len(), failing.len());
    assert_eq!(report.failed_platforms(), vec!["linux/arm64", "windows/arm64"]);

    // Successful binaries stay on disk; nothing reaches the host.
    for artifact in &build.artifacts {
        assert!(artifact.path.exists());
    }
    assert!(host.releases().is_empty());
    assert_eq!(report.state(), PublishState::Unpublished);
}

#[tokio::test]
async fn one_failed_upload_is_reported_as_partial() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryReleaseHost::new().failing_asset(
        "tool_windows_amd64.exe",
        HostError::Network("connection reset".to_string()),
    ));
    let platforms = vec![
        PlatformTarget::new("linux", "amd64"),
        PlatformTarget::new("windows", "amd64"),
        PlatformTarget::new("darwin", "amd64"),
    ];
    let orchestrator = orchestrator(
        dir.path(),
        config(platforms),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new(),
        host.clone(),
    );

    let report = orchestrator.run(&ReleaseRequest::new("v1.2.0")).await;

    assert!(!report.is_success());
    assert_eq!(report.state(), PublishState::PartiallyPublished);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Publish);
    assert!(
        matches!(failure.error, ShipyardError::AssetUploadFailed { ref assets } if assets == &["tool_windows_amd64.exe"])
    );
    let publish = report.publish.as_ref().unwrap();
    assert_eq!(publish.outcomes.len(), 3);
    assert_eq!(publish.outcomes.iter().filter(|o| !o.succeeded).count(), 1);
    assert!(report.render_text().contains("Failed asset: tool_windows_amd64.exe"));
    assert_eq!(host.releases().len(), 1);
}

#[tokio::test]
async fn rerunning_a_published_tag_is_a_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryReleaseHost::new());
    let orchestrator = orchestrator(
        dir.path(),
        config(vec![PlatformTarget::new("linux", "amd64")]),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new(),
        host.clone(),
    );
    let request = ReleaseRequest::new("v2.0.0");

    let first = orchestrator.run(&request).await;
    assert!(first.is_success(), "{}", first.render_text());
    let original = host.releases();

    let second = orchestrator.run(&request).await;
    let failure = second.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Publish);
    assert!(matches!(failure.error, ShipyardError::DuplicateRelease { ref tag } if tag == "v2.0.0"));
    assert_eq!(second.state(), PublishState::Failed);
    assert_eq!(host.releases(), original);
    assert_eq!(host.uploads().len(), 1);
}

#[tokio::test]
async fn changelog_groups_three_commits_without_prior_history() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(
        dir.path(),
        config(vec![PlatformTarget::new("linux", "amd64")]),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new(),
        Arc::new(MemoryReleaseHost::new()),
    );

    let outcome = orchestrator
        .generate_changelog("v0.1.0", ChangelogMode::Required)
        .await
        .unwrap()
        .unwrap();

    let changelog = &outcome.changelog;
    assert_eq!(changelog.sections.len(), 3);
    assert_eq!(changelog.section(ChangeKind::Feat).len(), 1);
    assert_eq!(changelog.section(ChangeKind::Fix).len(), 1);
    let other = changelog.section(ChangeKind::Other);
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].description, "bad message no colon");

    let written = std::fs::read_to_string(dir.path().join("CHANGELOG.md")).unwrap();
    let features = written.find("## Features").unwrap();
    let fixes = written.find("## Bug Fixes").unwrap();
    let others = written.find("## Other Changes").unwrap();
    assert!(features < fixes && fixes < others);
    assert!(written.contains("- (x) a (a1a1a1a)"));
    assert!(written.contains("## Contributors\n\n- alice\n- bob\n- carol\n"));
}

#[tokio::test]
async fn second_changelog_run_prepends_without_repeating_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("CHANGELOG.md");
    std::fs::write(&path, "# Changelog for v0.0.1\n\n- older notes (a1a1a1a)\n").unwrap();
    let existing = std::fs::read_to_string(&path).unwrap();

    let orchestrator = orchestrator(
        dir.path(),
        config(vec![PlatformTarget::new("linux", "amd64")]),
        StaticCommitSource::new(sample_history()).with_reference("v0.0.1"),
        ScriptedCompiler::new(),
        Arc::new(MemoryReleaseHost::new()),
    );

    let outcome = orchestrator
        .generate_changelog("v0.2.0", ChangelogMode::Auto)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.changelog.entry_count(), 2);
    assert!(outcome.changelog.section(ChangeKind::Feat).is_empty());
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.starts_with("# Changelog for v0.2.0"));
    assert!(written.ends_with(&existing));
}

#[tokio::test]
async fn regenerating_the_same_version_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(
        dir.path(),
        config(vec![PlatformTarget::new("linux", "amd64")]),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new(),
        Arc::new(MemoryReleaseHost::new()),
    );
    let path = dir.path().join("CHANGELOG.md");

    let first = orchestrator
        .generate_changelog("v1.0.0", ChangelogMode::Required)
        .await
        .unwrap()
        .unwrap();
    assert!(first.rendered.is_some());
    let written = std::fs::read_to_string(&path).unwrap();

    let second = orchestrator
        .generate_changelog("v1.0.0", ChangelogMode::Required)
        .await
        .unwrap()
        .unwrap();
    assert!(second.rendered.is_none());
    assert_eq!(second.changelog.entry_count(), 0);

    let after = std::fs::read_to_string(&path).unwrap();
    assert_eq!(after, written);
    assert_eq!(after.matches("# Changelog for v1.0.0").count(), 1);
}

#[tokio::test]
async fn dry_run_builds_but_never_touches_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryReleaseHost::new());
    let orchestrator = orchestrator(
        dir.path(),
        config(vec![
            PlatformTarget::new("linux", "amd64"),
            PlatformTarget::new("windows", "arm64"),
        ]),
        StaticCommitSource::new(sample_history()),
        ScriptedCompiler::new(),
        host.clone(),
    );
    let mut request = ReleaseRequest::new("v3.0.0-rc1");
    request.dry_run = true;
    request.changelog = ChangelogMode::Skip;

    let report = orchestrator.run(&request).await;

    assert!(report.is_success());
    assert!(report.changelog.is_none());
    assert_eq!(report.build.as_ref().unwrap().artifacts.len(), 2);
    assert!(host.releases().is_empty());
    assert!(!dir.path().join("CHANGELOG.md").exists());
    assert_eq!(report.to_json()["state"], "unpublished");
}
