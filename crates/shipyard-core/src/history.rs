//! Commit history source.
//!
//! The release engine does not walk history itself; it asks a
//! [`CommitSource`] for raw commit records since the last reference point.
//! [`GitLog`] answers using the system `git` binary.

use crate::error::{Result, ShipyardError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Field separator used in the `git log` pretty format (ASCII unit separator).
const FIELD_SEP: char = '\u{1f}';

/// One commit as reported by version control, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommit {
    pub hash: String,
    pub author: String,
    /// Timestamp text as emitted by the source; parsed during compilation.
    pub timestamp: String,
    pub message: String,
}

/// Supplies commit records to the changelog compiler.
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// The most recent release reference point, or `None` when there is none.
    async fn last_reference(&self) -> Result<Option<String>>;

    /// Commits after `since` (full history when `None`), newest first.
    async fn commits_since(&self, since: Option<&str>) -> Result<Vec<RawCommit>>;

    /// Identifier of the commit being released.
    async fn head_commit(&self) -> Result<String>;
}

/// [`CommitSource`] backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitLog {
    repo_dir: PathBuf,
}

impl GitLog {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| ShipyardError::HistoryUnavailable(format!("failed to run git: {e}")))
    }
}

#[async_trait]
impl CommitSource for GitLog {
    async fn last_reference(&self) -> Result<Option<String>> {
        let output = self.git(&["describe", "--tags", "--abbrev=0"]).await?;
        if output.status.success() {
            let tag = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok((!tag.is_empty()).then_some(tag));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        // No tags yet (or no commits yet): full history.
        if stderr.contains("No names found")
            || stderr.contains("cannot describe")
            || stderr.contains("No tags can describe")
        {
            debug!("no release tags found; using full history");
            return Ok(None);
        }
        Err(ShipyardError::HistoryUnavailable(format!(
            "git describe failed: {}",
            stderr.trim()
        )))
    }

    async fn commits_since(&self, since: Option<&str>) -> Result<Vec<RawCommit>> {
        let format = format!("--pretty=format:%H{FIELD_SEP}%an{FIELD_SEP}%aI{FIELD_SEP}%s");
        let range = since.map(|tag| format!("{tag}..HEAD"));
        let mut args = vec!["log", format.as_str()];
        if let Some(range) = range.as_deref() {
            args.push(range);
        }

        let output = self.git(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A repository without commits has no history to report.
            if stderr.contains("does not have any commits") {
                return Ok(Vec::new());
            }
            return Err(ShipyardError::HistoryUnavailable(format!(
                "git log failed: {}",
                stderr.trim()
            )));
        }

        Ok(parse_log(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn head_commit(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "HEAD"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShipyardError::HistoryUnavailable(format!(
                "git rev-parse HEAD failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse `git log` output in the separator format; lines with the wrong number
/// of fields are skipped.
pub fn parse_log(text: &str) -> Vec<RawCommit> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(4, FIELD_SEP).collect();
            match fields.as_slice() {
                [hash, author, timestamp, message] => Some(RawCommit {
                    hash: hash.to_string(),
                    author: author.to_string(),
                    timestamp: timestamp.to_string(),
                    message: message.to_string(),
                }),
                _ => {
                    warn!(line = %line, "skipping unreadable git log line");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["config", "tag.gpgsign", "false"]);
        run_git(dir.path(), &["config", "commit.gpgsign", "false"]);
        dir
    }

    #[test]
    fn parse_log_splits_fields() {
        let text = format!(
            "abc{s}alice{s}2026-03-01T00:00:00+00:00{s}feat: x\ndef{s}bob{s}2026-03-02T00:00:00+00:00{s}fix: a{s}b",
            s = FIELD_SEP
        );
        let commits = parse_log(&text);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].author, "alice");
        assert_eq!(commits[1].message, format!("fix: a{FIELD_SEP}b"));
    }

    #[test]
    fn parse_log_skips_short_lines() {
        let commits = parse_log("only-a-hash\n\n");
        assert!(commits.is_empty());
    }

    #[tokio::test]
    async fn full_history_without_tags() {
        let repo = make_git_repo();
        run_git(repo.path(), &["commit", "--allow-empty", "-m", "feat: first"]);
        run_git(repo.path(), &["commit", "--allow-empty", "-m", "fix: second"]);

        let log = GitLog::new(repo.path());
        assert_eq!(log.last_reference().await.unwrap(), None);

        let commits = log.commits_since(None).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "fix: second");
        assert_eq!(commits[0].author, "test-user");
        assert!(crate::changelog::parse_commit_timestamp(&commits[0].timestamp).is_some());
    }

    #[tokio::test]
    async fn commits_since_last_tag() {
        let repo = make_git_repo();
        run_git(repo.path(), &["commit", "--allow-empty", "-m", "feat: released"]);
        run_git(repo.path(), &["tag", "v0.1.0"]);
        run_git(repo.path(), &["commit", "--allow-empty", "-m", "fix: unreleased"]);

        let log = GitLog::new(repo.path());
        let tag = log.last_reference().await.unwrap();
        assert_eq!(tag.as_deref(), Some("v0.1.0"));

        let commits = log.commits_since(tag.as_deref()).await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].message, "fix: unreleased");

        let head = log.head_commit().await.unwrap();
        assert_eq!(head, commits[0].hash);
    }

    #[tokio::test]
    async fn outside_a_repository_history_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let log = GitLog::new(dir.path());
        let err = log.commits_since(None).await.unwrap_err();
        assert!(matches!(err, ShipyardError::HistoryUnavailable(_)));
    }
}
