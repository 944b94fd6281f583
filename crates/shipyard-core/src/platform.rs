//! Build target platforms.

use serde::{Deserialize, Serialize};

/// Operating systems the build matrix may name.
pub const KNOWN_OS: &[&str] = &["darwin", "linux", "windows"];

/// Architectures the build matrix may name.
pub const KNOWN_ARCH: &[&str] = &["amd64", "arm64"];

/// An operating-system/architecture pair to compile for.
///
/// Values are kept as the strings read from configuration. Configuration
/// validation rejects unknown pairs, but the build coordinator still checks
/// [`PlatformTarget::is_supported`] and reports an unsupported pair as a
/// build failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub os: String,
    pub arch: String,
}

impl PlatformTarget {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Whether both halves of the pair are in the known set.
    pub fn is_supported(&self) -> bool {
        KNOWN_OS.contains(&self.os.as_str()) && KNOWN_ARCH.contains(&self.arch.as_str())
    }

    /// Output file name: `{project}_{os}_{arch}`, with `.exe` on windows.
    pub fn binary_name(&self, project: &str) -> String {
        let mut name = format!("{}_{}_{}", project, self.os, self.arch);
        if self.os == "windows" {
            name.push_str(".exe");
        }
        name
    }
}

impl std::fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// The matrix used when configuration names no platforms.
///
/// Returns a fresh value on every call; callers inject it into configuration.
pub fn default_matrix() -> Vec<PlatformTarget> {
    KNOWN_OS
        .iter()
        .flat_map(|os| KNOWN_ARCH.iter().map(move |arch| PlatformTarget::new(*os, *arch)))
        .collect()
}
