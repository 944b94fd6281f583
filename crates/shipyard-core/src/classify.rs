//! Conventional-commit classification.
//!
//! Turns one raw commit message into a [`ClassifiedMessage`]. Classification is
//! total: a message that does not follow `type(scope): description` is kept
//! verbatim under [`ChangeKind::Other`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Kind of change, declared in changelog section order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Feat,
    Fix,
    Docs,
    Style,
    Refactor,
    Perf,
    Test,
    Build,
    Ci,
    Chore,
    Other,
}

impl ChangeKind {
    /// Every kind in section order.
    pub const ORDERED: [ChangeKind; 11] = [
        ChangeKind::Feat,
        ChangeKind::Fix,
        ChangeKind::Docs,
        ChangeKind::Style,
        ChangeKind::Refactor,
        ChangeKind::Perf,
        ChangeKind::Test,
        ChangeKind::Build,
        ChangeKind::Ci,
        ChangeKind::Chore,
        ChangeKind::Other,
    ];

    /// Match a type token exactly (case-sensitive). `other` is not a token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "feat" => Some(Self::Feat),
            "fix" => Some(Self::Fix),
            "docs" => Some(Self::Docs),
            "style" => Some(Self::Style),
            "refactor" => Some(Self::Refactor),
            "perf" => Some(Self::Perf),
            "test" => Some(Self::Test),
            "build" => Some(Self::Build),
            "ci" => Some(Self::Ci),
            "chore" => Some(Self::Chore),
            _ => None,
        }
    }

    /// Changelog section heading.
    pub fn section_title(&self) -> &'static str {
        match self {
            Self::Feat => "Features",
            Self::Fix => "Bug Fixes",
            Self::Docs => "Documentation",
            Self::Style => "Styles",
            Self::Refactor => "Code Refactoring",
            Self::Perf => "Performance Improvements",
            Self::Test => "Tests",
            Self::Build => "Builds",
            Self::Ci => "Continuous Integration",
            Self::Chore => "Chores",
            Self::Other => "Other Changes",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.section_title())
    }
}

/// The part of a change entry derived from the message alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedMessage {
    pub kind: ChangeKind,
    pub scope: Option<String>,
    pub description: String,
    /// `type!:` marker.
    pub breaking: bool,
}

fn commit_grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        Regex::new(r"^(\w+)(?:\(([\w./-]+)\))?(!)?:\s*(.+)$")
            .expect("conventional commit grammar is a valid regex")
    })
}

/// Classify a raw commit message.
///
/// Only the first line is matched against the grammar. A matching line with a
/// type outside the known set classifies as [`ChangeKind::Other`] but keeps its
/// parsed scope and description. A non-matching message becomes `Other` with
/// the entire message as description.
pub fn classify(message: &str) -> ClassifiedMessage {
    let first_line = message.lines().next().unwrap_or("").trim_end();

    let Some(caps) = commit_grammar().captures(first_line) else {
        return ClassifiedMessage {
            kind: ChangeKind::Other,
            scope: None,
            description: message.to_string(),
            breaking: false,
        };
    };

    let kind = ChangeKind::from_token(&caps[1]).unwrap_or(ChangeKind::Other);
    ClassifiedMessage {
        kind,
        scope: caps.get(2).map(|m| m.as_str().to_string()),
        description: caps[4].to_string(),
        breaking: caps.get(3).is_some(),
    }
}
