//! Changelog compilation from commit history.
//!
//! [`compile`] classifies raw commits, groups them by [`ChangeKind`] in fixed
//! section order and collects contributors. The rendered document is prepended
//! to any existing changelog file, never replacing it.

use crate::classify::{classify, ChangeKind};
use crate::error::{Result, ShipyardError};
use crate::history::RawCommit;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Text placed between the newest section and the existing document.
pub const MERGE_SEPARATOR: &str = "\n\n";

/// Length of the abbreviated hash rendered next to each entry.
const SHORT_HASH_LEN: usize = 7;

/// Output format of the rendered changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangelogFormat {
    #[default]
    Markdown,
    Json,
}

/// One classified commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub scope: Option<String>,
    pub description: String,
    pub breaking: bool,
    pub commit_hash: String,
    pub author: String,
    pub timestamp: DateTime<FixedOffset>,
}

impl ChangeEntry {
    pub fn short_hash(&self) -> &str {
        short_hash(&self.commit_hash)
    }
}

/// Changes for one version, grouped by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changelog {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    /// Only kinds with at least one entry are present.
    pub sections: BTreeMap<ChangeKind, Vec<ChangeEntry>>,
    pub contributors: BTreeSet<String>,
}

/// Parse the timestamp formats git emits: strict ISO 8601 (`%aI`), RFC 2822
/// (`%aD`) and the default `Mon Jan 2 15:04:05 2006 -0700` form.
pub fn parse_commit_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_rfc2822(text))
        .or_else(|_| DateTime::parse_from_str(text, "%a %b %e %H:%M:%S %Y %z"))
        .ok()
}

fn check_record(raw: &RawCommit) -> Result<DateTime<FixedOffset>> {
    if raw.hash.trim().is_empty() {
        return Err(ShipyardError::MalformedCommitRecord {
            hash: String::new(),
            reason: format!("missing hash (author {})", raw.author),
        });
    }
    parse_commit_timestamp(&raw.timestamp).ok_or_else(|| ShipyardError::MalformedCommitRecord {
        hash: short_hash(&raw.hash).to_string(),
        reason: format!("unparsable timestamp {:?}", raw.timestamp),
    })
}

fn short_hash(hash: &str) -> &str {
    let end = hash
        .char_indices()
        .nth(SHORT_HASH_LEN)
        .map(|(i, _)| i)
        .unwrap_or(hash.len());
    &hash[..end]
}

/// Compile a changelog for `version`, stamped with the current time.
pub fn compile(commits: &[RawCommit], version: &str) -> Changelog {
    compile_at(commits, version, Utc::now())
}

/// Compile a changelog with an explicit generation time.
///
/// Records with an empty hash or an unparsable timestamp are dropped with a
/// warning. A hash seen twice is emitted once.
pub fn compile_at(commits: &[RawCommit], version: &str, generated_at: DateTime<Utc>) -> Changelog {
    let mut seen = HashSet::new();
    let mut sections: BTreeMap<ChangeKind, Vec<ChangeEntry>> = BTreeMap::new();
    let mut dropped = 0usize;

    for raw in commits {
        let timestamp = match check_record(raw) {
            Ok(timestamp) => timestamp,
            Err(err) => {
                warn!(error = %err, "dropping commit record");
                dropped += 1;
                continue;
            }
        };
        if !seen.insert(raw.hash.clone()) {
            debug!(commit = %short_hash(&raw.hash), "skipping duplicate commit");
            continue;
        }

        let classified = classify(&raw.message);
        sections.entry(classified.kind).or_default().push(ChangeEntry {
            kind: classified.kind,
            scope: classified.scope,
            description: classified.description,
            breaking: classified.breaking,
            commit_hash: raw.hash.clone(),
            author: raw.author.clone(),
            timestamp,
        });
    }

    for entries in sections.values_mut() {
        // Stable: equal timestamps keep history order.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    let mut changelog = Changelog {
        version: version.to_string(),
        generated_at,
        sections,
        contributors: BTreeSet::new(),
    };
    changelog.refresh_contributors();

    info!(
        version = %version,
        entries = changelog.entry_count(),
        dropped = dropped,
        "compiled changelog"
    );
    changelog
}

impl Changelog {
    /// Total number of entries across all sections.
    pub fn entry_count(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Entries of one kind, most recent first.
    pub fn section(&self, kind: ChangeKind) -> &[ChangeEntry] {
        self.sections.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn refresh_contributors(&mut self) {
        self.contributors = self
            .sections
            .values()
            .flatten()
            .map(|e| e.author.clone())
            .collect();
    }

    /// Drop entries whose commit is already recorded in `existing`.
    ///
    /// In markdown a commit is recorded when an entry line (`- ...`) ends with
    /// its `(shorthash)` marker. In JSON it is recorded when an entry carries
    /// the same full `commit_hash`. Returns the number of entries removed.
    pub fn drop_recorded(&mut self, existing: &str, format: ChangelogFormat) -> Result<usize> {
        if existing.trim().is_empty() {
            return Ok(0);
        }
        let recorded = recorded_hashes(existing, format)?;
        let before = self.entry_count();
        for entries in self.sections.values_mut() {
            entries.retain(|e| {
                let key = match format {
                    ChangelogFormat::Markdown => e.short_hash(),
                    ChangelogFormat::Json => e.commit_hash.as_str(),
                };
                !recorded.contains(key)
            });
        }
        self.sections.retain(|_, entries| !entries.is_empty());
        self.refresh_contributors();
        Ok(before - self.entry_count())
    }

    /// Render in the requested format.
    pub fn render(&self, format: ChangelogFormat) -> Result<String> {
        match format {
            ChangelogFormat::Markdown => Ok(self.to_markdown()),
            ChangelogFormat::Json => self.to_json(),
        }
    }

    /// Render as markdown: version header, release date, one section per
    /// non-empty kind in fixed order, then contributors.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&markdown_header(&self.version));
        out.push_str("\n\n");
        out.push_str(&format!(
            "Release date: {}\n\n",
            self.generated_at.format("%Y-%m-%d")
        ));

        for (kind, entries) in &self.sections {
            out.push_str(&format!("## {}\n\n", kind.section_title()));
            for entry in entries {
                out.push_str("- ");
                if entry.breaking {
                    out.push_str("**BREAKING** ");
                }
                if let Some(scope) = &entry.scope {
                    out.push_str(&format!("({scope}) "));
                }
                out.push_str(&format!(
                    "{} {}\n",
                    entry.description,
                    hash_marker(entry.short_hash())
                ));
            }
            out.push('\n');
        }

        out.push_str("## Contributors\n\n");
        for author in &self.contributors {
            out.push_str(&format!("- {author}\n"));
        }
        out
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct ChangelogJson<'a> {
            version: &'a str,
            release_date: String,
            sections: Vec<SectionJson<'a>>,
            contributors: &'a BTreeSet<String>,
            total_entries: usize,
        }

        #[derive(Serialize)]
        struct SectionJson<'a> {
            kind: ChangeKind,
            title: &'static str,
            entries: &'a [ChangeEntry],
        }

        let json = ChangelogJson {
            version: &self.version,
            release_date: self.generated_at.format("%Y-%m-%d").to_string(),
            sections: self
                .sections
                .iter()
                .map(|(kind, entries)| SectionJson {
                    kind: *kind,
                    title: kind.section_title(),
                    entries,
                })
                .collect(),
            contributors: &self.contributors,
            total_entries: self.entry_count(),
        };
        Ok(serde_json::to_string_pretty(&json)?)
    }
}

fn hash_marker(short: &str) -> String {
    format!("({short})")
}

fn markdown_header(version: &str) -> String {
    format!("# Changelog for {version}")
}

/// Hash of a markdown entry line, taken from its trailing `(shorthash)`.
fn entry_line_hash(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix("- ")?;
    let inner = rest.strip_suffix(')')?;
    let open = inner.rfind('(')?;
    Some(&inner[open + 1..])
}

/// Versions stored in a JSON changelog, newest first. A single object from
/// an older file counts as a one-element list.
fn json_versions(existing: &str) -> Result<Vec<serde_json::Value>> {
    if existing.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<serde_json::Value>(existing)? {
        serde_json::Value::Array(items) => Ok(items),
        object @ serde_json::Value::Object(_) => Ok(vec![object]),
        _ => Err(ShipyardError::Serialization(
            "changelog JSON must be an object or an array of objects".to_string(),
        )),
    }
}

fn recorded_hashes(existing: &str, format: ChangelogFormat) -> Result<HashSet<String>> {
    match format {
        ChangelogFormat::Markdown => Ok(existing
            .lines()
            .filter_map(entry_line_hash)
            .map(str::to_string)
            .collect()),
        ChangelogFormat::Json => {
            let mut hashes = HashSet::new();
            for version in json_versions(existing)? {
                let Some(sections) = version["sections"].as_array() else {
                    continue;
                };
                for section in sections {
                    let Some(entries) = section["entries"].as_array() else {
                        continue;
                    };
                    hashes.extend(
                        entries
                            .iter()
                            .filter_map(|e| e["commit_hash"].as_str())
                            .map(str::to_string),
                    );
                }
            }
            Ok(hashes)
        }
    }
}

/// Whether `existing` already holds a section for `version`.
pub fn has_version(existing: &str, version: &str, format: ChangelogFormat) -> Result<bool> {
    match format {
        ChangelogFormat::Markdown => {
            let header = markdown_header(version);
            Ok(existing.lines().any(|line| line.trim_end() == header))
        }
        ChangelogFormat::Json => Ok(json_versions(existing)?
            .iter()
            .any(|v| v["version"].as_str() == Some(version))),
    }
}

/// Read the existing changelog at `path`; a missing file is empty history.
pub async fn read_existing(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Prepend `newest` to `existing`. The result always ends with `existing`.
pub fn prepend(newest: &str, existing: &str) -> String {
    if existing.is_empty() {
        return newest.to_string();
    }
    format!("{newest}{MERGE_SEPARATOR}{existing}")
}

/// Prepend `newest` to the document currently at `existing_path`.
pub async fn merge(newest: &str, existing_path: &Path) -> Result<String> {
    let existing = read_existing(existing_path).await?;
    Ok(prepend(newest, &existing))
}

/// Prepend a rendered section to a document of the same format.
///
/// Markdown is joined as text. A JSON changelog is an array of versions,
/// newest first, so the new object becomes its first element.
pub fn prepend_document(newest: &str, existing: &str, format: ChangelogFormat) -> Result<String> {
    match format {
        ChangelogFormat::Markdown => Ok(prepend(newest, existing)),
        ChangelogFormat::Json => {
            let mut versions = json_versions(existing)?;
            versions.insert(0, serde_json::from_str(newest)?);
            Ok(serde_json::to_string_pretty(&versions)?)
        }
    }
}

/// Write `content` to `path`, creating parent directories as needed.
pub async fn write_document(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// Render `changelog` and prepend it to the file at `path`.
///
/// Entries already recorded in the existing file are not emitted again.
/// When nothing new remains and the file already has a section for this
/// version, the file is left untouched and `None` is returned. Otherwise
/// returns the newly rendered section.
pub async fn update_file(
    changelog: &mut Changelog,
    path: &Path,
    format: ChangelogFormat,
) -> Result<Option<String>> {
    let existing = read_existing(path).await?;
    let already = changelog.drop_recorded(&existing, format)?;
    if already > 0 {
        info!(path = %path.display(), skipped = already, "skipping entries already in changelog");
    }
    if changelog.is_empty() && has_version(&existing, &changelog.version, format)? {
        info!(
            path = %path.display(),
            version = %changelog.version,
            "changelog already up to date"
        );
        return Ok(None);
    }
    let newest = changelog.render(format)?;
    write_document(path, &prepend_document(&newest, &existing, format)?).await?;
    info!(path = %path.display(), version = %changelog.version, "wrote changelog");
    Ok(Some(newest))
}
