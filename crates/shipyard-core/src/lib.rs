//! Shipyard Core Library
//!
//! Release orchestration: turns a configuration and a version tag into a
//! changelog, a set of per-platform binaries, and a published release.

pub mod build;
pub mod changelog;
pub mod classify;
pub mod config;
pub mod error;
pub mod fakes;
pub mod history;
pub mod orchestrator;
pub mod platform;
pub mod publish;
pub mod telemetry;

pub use build::{
    run_hooks, BuildArtifact, BuildCoordinator, BuildFailure, BuildParams, BuildReport,
    CommandCompiler, CompileInvocation, CompileOutput, Compiler,
};

pub use changelog::{ChangeEntry, Changelog, ChangelogFormat};

pub use classify::{classify, ChangeKind, ClassifiedMessage};

pub use config::{ShipyardConfig, DEFAULT_CONFIG_FILE};

pub use error::{Result, ShipyardError};

pub use history::{CommitSource, GitLog, RawCommit};

pub use orchestrator::{
    parse_repo_ref, ChangelogMode, ChangelogOutcome, ReleaseOrchestrator, ReleaseReport,
    ReleaseRequest, RepoRef, Stage, StageFailure,
};

pub use platform::{default_matrix, PlatformTarget};

pub use publish::{
    AssetPayload, HostError, PublishReport, PublishState, ReleaseDraft, ReleaseHost,
    ReleasePublisher, ReleaseRecord, UploadOutcome,
};

pub use telemetry::init_tracing;

/// Crate version, reported by `shipyard --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
