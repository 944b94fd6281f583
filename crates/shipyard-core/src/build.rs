//! Platform build coordination.
//!
//! [`BuildCoordinator::build_all`] compiles one binary per platform, all
//! platforms concurrently, and waits for every build to finish before
//! reporting. A failing platform never cancels its siblings; the report
//! carries every artifact and every failure.

use crate::config::CompilerConfig;
use crate::error::{Result, ShipyardError};
use crate::platform::PlatformTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// One request to the external compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileInvocation {
    pub platform: PlatformTarget,
    pub output_path: PathBuf,
    pub entry_point: String,
    /// Already expanded; `None` when no link flags are configured.
    pub link_flags: Option<String>,
    /// Extra environment layered over the platform variables.
    pub env: BTreeMap<String, String>,
}

/// What the compiler reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    pub success: bool,
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub diagnostics: String,
}

/// External compiler toolchain.
///
/// `Err` means the compiler could not be run at all; a compiler that ran and
/// rejected the input returns `Ok` with `success == false`.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, invocation: &CompileInvocation) -> Result<CompileOutput>;
}

/// [`Compiler`] that spawns the configured toolchain program.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    settings: CompilerConfig,
}

impl CommandCompiler {
    pub fn new(settings: CompilerConfig) -> Self {
        Self { settings }
    }

    /// Argument vector for `invocation` (program excluded).
    pub fn args_for(&self, invocation: &CompileInvocation) -> Vec<String> {
        let mut args = self.settings.args.clone();
        if let Some(flags) = &invocation.link_flags {
            args.push(self.settings.link_flags_arg.clone());
            args.push(flags.clone());
        }
        args.push(self.settings.output_arg.clone());
        args.push(invocation.output_path.to_string_lossy().into_owned());
        if !invocation.entry_point.is_empty() {
            args.push(invocation.entry_point.clone());
        }
        args
    }

    /// Environment for `invocation`: toolchain defaults, then the target
    /// platform, then the caller's extra variables.
    pub fn env_for(&self, invocation: &CompileInvocation) -> BTreeMap<String, String> {
        let mut env = self.settings.env.clone();
        env.insert(self.settings.os_env.clone(), invocation.platform.os.clone());
        env.insert(
            self.settings.arch_env.clone(),
            invocation.platform.arch.clone(),
        );
        env.extend(invocation.env.clone());
        env
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(&self, invocation: &CompileInvocation) -> Result<CompileOutput> {
        let output = Command::new(&self.settings.program)
            .args(self.args_for(invocation))
            .envs(self.env_for(invocation))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut diagnostics = String::from_utf8_lossy(&output.stdout).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CompileOutput {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            diagnostics,
        })
    }
}

/// Inputs shared by every platform build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildParams {
    pub project_name: String,
    pub main_entry: String,
    pub output_dir: PathBuf,
    /// Expanded link flags; empty means none.
    pub link_flags: String,
    pub extra_env: BTreeMap<String, String>,
    /// Per-invocation bound; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// A binary produced for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub platform: PlatformTarget,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the binary.
    pub sha256: String,
}

impl BuildArtifact {
    /// Base file name, used as the release asset name.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// A platform that did not produce a binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub platform: PlatformTarget,
    pub diagnostics: String,
}

/// Everything a build stage produced. Ordering carries no meaning.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// `output_dir/<version>`.
    pub output_dir: PathBuf,
    pub artifacts: Vec<BuildArtifact>,
    pub failures: Vec<BuildFailure>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed platforms as `os/arch`, sorted.
    pub fn failed_platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.failures.iter().map(|f| f.platform.to_string()).collect();
        names.sort();
        names
    }

    /// Convert into an error when any platform failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ShipyardError::CompileFailed {
                platforms: self.failed_platforms(),
            })
        }
    }
}

enum PlatformOutcome {
    Built(BuildArtifact),
    Failed(BuildFailure),
}

/// Fans platform builds out over the runtime.
#[derive(Clone)]
pub struct BuildCoordinator {
    compiler: Arc<dyn Compiler>,
}

impl BuildCoordinator {
    pub fn new(compiler: Arc<dyn Compiler>) -> Self {
        Self { compiler }
    }

    /// Build every platform in `matrix` into `output_dir/<version>/`.
    ///
    /// Only creating the output directory can fail the call itself; per
    /// platform failures are collected in the report.
    #[instrument(skip(self, matrix, params), fields(platforms = matrix.len()))]
    pub async fn build_all(
        &self,
        matrix: &[PlatformTarget],
        params: &BuildParams,
        version: &str,
    ) -> Result<BuildReport> {
        let output_dir = params.output_dir.join(version);
        tokio::fs::create_dir_all(&output_dir).await?;

        let mut seen = HashSet::new();
        let platforms: Vec<PlatformTarget> = matrix
            .iter()
            .filter(|p| seen.insert((*p).clone()))
            .cloned()
            .collect();
        let total = platforms.len();

        info!(
            platforms = total,
            output_dir = %output_dir.display(),
            "building binaries"
        );

        let report = Arc::new(Mutex::new(BuildReport {
            output_dir: output_dir.clone(),
            ..Default::default()
        }));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::with_capacity(total);

        for platform in platforms {
            let compiler = Arc::clone(&self.compiler);
            let report = Arc::clone(&report);
            let completed = Arc::clone(&completed);
            let params = params.clone();
            let output_dir = output_dir.clone();
            let task_platform = platform.clone();

            let task = tokio::spawn(async move {
                let outcome =
                    build_platform(compiler.as_ref(), &task_platform, &params, &output_dir).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

                let mut report = report.lock().await;
                match outcome {
                    PlatformOutcome::Built(artifact) => {
                        info!(
                            platform = %artifact.platform,
                            size_bytes = artifact.size_bytes,
                            progress = %format!("{done}/{total}"),
                            "built"
                        );
                        report.artifacts.push(artifact);
                    }
                    PlatformOutcome::Failed(failure) => {
                        warn!(
                            platform = %failure.platform,
                            progress = %format!("{done}/{total}"),
                            "build failed"
                        );
                        report.failures.push(failure);
                    }
                }
            });
            tasks.push((platform, task));
        }

        for (platform, task) in tasks {
            if let Err(e) = task.await {
                report.lock().await.failures.push(BuildFailure {
                    platform,
                    diagnostics: format!("build task aborted: {e}"),
                });
            }
        }

        let report = std::mem::take(&mut *report.lock().await);
        if report.is_success() {
            info!(artifacts = report.artifacts.len(), "all binaries built");
        } else {
            warn!(
                artifacts = report.artifacts.len(),
                failed = ?report.failed_platforms(),
                "some platforms failed to build"
            );
        }
        Ok(report)
    }
}

async fn build_platform(
    compiler: &dyn Compiler,
    platform: &PlatformTarget,
    params: &BuildParams,
    output_dir: &Path,
) -> PlatformOutcome {
    let fail = |diagnostics: String| {
        PlatformOutcome::Failed(BuildFailure {
            platform: platform.clone(),
            diagnostics,
        })
    };

    if !platform.is_supported() {
        return fail(format!("unsupported platform {platform}"));
    }

    let invocation = CompileInvocation {
        platform: platform.clone(),
        output_path: output_dir.join(platform.binary_name(&params.project_name)),
        entry_point: params.main_entry.clone(),
        link_flags: (!params.link_flags.is_empty()).then(|| params.link_flags.clone()),
        env: params.extra_env.clone(),
    };
    debug!(platform = %platform, output = %invocation.output_path.display(), "invoking compiler");

    let result = match params.timeout {
        Some(limit) => match tokio::time::timeout(limit, compiler.compile(&invocation)).await {
            Ok(result) => result,
            Err(_) => return fail(format!("compiler timed out after {}s", limit.as_secs())),
        },
        None => compiler.compile(&invocation).await,
    };

    let output = match result {
        Ok(output) => output,
        Err(e) => return fail(format!("failed to run compiler: {e}")),
    };
    if !output.success {
        return fail(format!(
            "compiler exited with code {}\n{}",
            output.exit_code, output.diagnostics
        ));
    }

    match describe_artifact(platform, &invocation.output_path).await {
        Ok(artifact) => PlatformOutcome::Built(artifact),
        Err(e) => fail(format!(
            "compiler reported success but {} is unreadable: {e}",
            invocation.output_path.display()
        )),
    }
}

async fn describe_artifact(platform: &PlatformTarget, path: &Path) -> Result<BuildArtifact> {
    let bytes = tokio::fs::read(path).await?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    Ok(BuildArtifact {
        platform: platform.clone(),
        path: path.to_path_buf(),
        size_bytes: bytes.len() as u64,
        sha256,
    })
}

/// Run shell hook commands one after another in `dir`.
///
/// Stops at the first command that exits unsuccessfully.
pub async fn run_hooks(commands: &[String], dir: &Path) -> Result<()> {
    for command in commands {
        info!(hook = %command, "running build hook");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ShipyardError::HookFailed {
                command: command.clone(),
                output: text.trim().to_string(),
            });
        }
    }
    Ok(())
}
