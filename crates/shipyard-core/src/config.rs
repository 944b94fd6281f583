//! Release configuration.
//!
//! Loaded from a YAML file, completed with defaults, then validated. Anything
//! that fails validation is reported as [`ShipyardError::ConfigInvalid`]
//! before any stage runs.

use crate::changelog::ChangelogFormat;
use crate::error::{Result, ShipyardError};
use crate::platform::{default_matrix, PlatformTarget};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "shipyard.yaml";

/// Complete configuration consumed by the release engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShipyardConfig {
    pub project: ProjectConfig,
    pub build: BuildConfig,
    pub release: ReleaseSettings,
    pub github: GitHubConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    pub description: String,
    pub version: Option<String>,
    pub license: Option<String>,
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildConfig {
    /// Entry point handed to the compiler.
    pub main_file: String,
    /// Artifacts land in `output_dir/<version>/`.
    pub output_dir: PathBuf,
    /// Empty means "use the default matrix".
    pub platforms: Vec<PlatformTarget>,
    /// Link-time flags; may use `{version}`, `{commit}` and `{date}`.
    pub ldflags: String,
    /// Extra environment for every compiler invocation.
    pub env: BTreeMap<String, String>,
    /// Shell commands run before the platform builds.
    pub before: Vec<String>,
    /// Shell commands run after every platform built successfully.
    pub after: Vec<String>,
    /// Per-invocation timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
    pub compiler: CompilerConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            main_file: "main.go".to_string(),
            output_dir: PathBuf::from("dist"),
            platforms: Vec::new(),
            ldflags: String::new(),
            env: BTreeMap::new(),
            before: Vec::new(),
            after: Vec::new(),
            timeout_secs: 600,
            compiler: CompilerConfig::default(),
        }
    }
}

/// How the external compiler is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompilerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Variable that receives the target operating system.
    pub os_env: String,
    /// Variable that receives the target architecture.
    pub arch_env: String,
    /// Flag that precedes the link flags.
    pub link_flags_arg: String,
    /// Flag that precedes the output path.
    pub output_arg: String,
    /// Environment applied before `build.env`.
    pub env: BTreeMap<String, String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "go".to_string(),
            args: vec!["build".to_string(), "-v".to_string()],
            os_env: "GOOS".to_string(),
            arch_env: "GOARCH".to_string(),
            link_flags_arg: "-ldflags".to_string(),
            output_arg: "-o".to_string(),
            env: BTreeMap::from([("CGO_ENABLED".to_string(), "0".to_string())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReleaseSettings {
    pub default_branch: String,
    pub changelog: ChangelogSettings,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            changelog: ChangelogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangelogSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub format: ChangelogFormat,
}

impl Default for ChangelogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("CHANGELOG.md"),
            format: ChangelogFormat::Markdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitHubConfig {
    /// `github.com/<owner>/<repo>`.
    pub default_repo: Option<String>,
    /// Name of the environment variable holding the API token.
    pub token_env: String,
    pub api_url: String,
    pub uploads_url: String,
    /// Upper bound on concurrently running asset uploads.
    pub max_concurrent_uploads: usize,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            default_repo: None,
            token_env: "GITHUB_TOKEN".to_string(),
            api_url: "https://api.github.com".to_string(),
            uploads_url: "https://uploads.github.com".to_string(),
            max_concurrent_uploads: 4,
        }
    }
}

impl ShipyardConfig {
    /// Read, complete and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShipyardError::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&text)?;
        config.apply_defaults(&current_dir_name());
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without applying defaults or validating.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| ShipyardError::ConfigInvalid(format!("failed to parse config: {e}")))
    }

    /// An all-defaults configuration for `project_name`.
    pub fn for_project(project_name: &str) -> Self {
        let mut config = Self::default();
        config.apply_defaults(project_name);
        config
    }

    /// Fill fields left empty by the file.
    pub fn apply_defaults(&mut self, fallback_name: &str) {
        if self.project.name.is_empty() {
            self.project.name = fallback_name.to_string();
        }
        if self.build.main_file.is_empty() {
            self.build.main_file = "main.go".to_string();
        }
        if self.build.output_dir.as_os_str().is_empty() {
            self.build.output_dir = PathBuf::from("dist");
        }
        if self.build.platforms.is_empty() {
            self.build.platforms = default_matrix();
        }
        if self.release.default_branch.is_empty() {
            self.release.default_branch = "main".to_string();
        }
        if self.release.changelog.path.as_os_str().is_empty() {
            self.release.changelog.path = PathBuf::from("CHANGELOG.md");
        }
        if self.github.token_env.is_empty() {
            self.github.token_env = "GITHUB_TOKEN".to_string();
        }
    }

    /// Check every constraint the release engine relies on.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(ShipyardError::ConfigInvalid(msg)) };

        if !matches_pattern(r"^[a-zA-Z0-9][a-zA-Z0-9-]*$", &self.project.name) {
            return invalid(format!("invalid project name: {}", self.project.name));
        }
        if let Some(version) = &self.project.version {
            if !is_valid_version(version) {
                return invalid(format!("invalid version format: {version}"));
            }
        }
        for platform in &self.build.platforms {
            if !platform.is_supported() {
                return invalid(format!("invalid platform: {platform}"));
            }
        }
        if let Some(repo) = &self.github.default_repo {
            if !matches_pattern(r"^github\.com/[a-zA-Z0-9-]+/[a-zA-Z0-9._-]+$", repo) {
                return invalid(format!("invalid GitHub repository: {repo}"));
            }
        }
        if self.github.max_concurrent_uploads == 0 {
            return invalid("maxConcurrentUploads must be at least 1".to_string());
        }
        if self.build.compiler.program.is_empty() {
            return invalid("compiler program must not be empty".to_string());
        }
        expand_link_flags(&self.build.ldflags, &LinkFlagValues::default())?;
        Ok(())
    }

    /// Write this configuration as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

/// Whether `version` looks like `v1.2.3` or `1.2.3-rc1`.
pub fn is_valid_version(version: &str) -> bool {
    matches_pattern(r"^v?\d+\.\d+\.\d+(-[a-zA-Z0-9.]+)?$", version)
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn current_dir_name() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Values available to link-flag placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkFlagValues {
    pub version: String,
    pub commit: String,
    pub date: String,
}

/// Substitute `{version}`, `{commit}` and `{date}` in `template`.
///
/// `{{` and `}}` produce literal braces. Any other placeholder, or an
/// unterminated one, is a configuration error.
pub fn expand_link_flags(template: &str, values: &LinkFlagValues) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(ShipyardError::ConfigInvalid(format!(
                        "unterminated placeholder in ldflags: {{{name}"
                    )));
                }
                match name.as_str() {
                    "version" => out.push_str(&values.version),
                    "commit" => out.push_str(&values.commit),
                    "date" => out.push_str(&values.date),
                    other => {
                        return Err(ShipyardError::ConfigInvalid(format!(
                            "unknown placeholder in ldflags: {{{other}}}"
                        )))
                    }
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
