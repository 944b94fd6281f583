//! Shipyard - multi-platform release automation
//!
//! ## Commands
//!
//! - `release`: changelog, cross-compile, and publish a GitHub release
//! - `changelog`: prepend the changelog for a version
//! - `build`: cross-compile the platform matrix
//! - `init`: write a default `shipyard.yaml`

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shipyard_core::{
    parse_repo_ref, BuildReport, ChangelogMode, CommandCompiler, GitLog, ReleaseHost,
    ReleaseOrchestrator, ReleaseRequest, ShipyardConfig, DEFAULT_CONFIG_FILE,
};
use shipyard_github::{GitHubClient, RepoScopedClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version = shipyard_core::VERSION)]
#[command(about = "Changelog, cross-compile and publish releases", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and a JSON report
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the changelog, build every platform and publish the release
    Release(ReleaseArgs),

    /// Prepend the changelog for a version
    Changelog {
        /// Version the changelog describes
        #[arg(long = "version", value_name = "VERSION")]
        release_version: String,
    },

    /// Build binaries for every configured platform
    Build {
        /// Version used for the output directory and link flags
        #[arg(long = "version", value_name = "VERSION")]
        release_version: String,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct ReleaseArgs {
    /// Version tag to release (e.g. v1.2.3)
    #[arg(long)]
    tag: String,

    /// Repository as github.com/<owner>/<repo> (default: github.defaultRepo)
    #[arg(long)]
    repo: Option<String>,

    /// Release title (default: the tag)
    #[arg(long)]
    title: Option<String>,

    /// Create the release as a draft
    #[arg(long)]
    draft: bool,

    /// Mark the release as a prerelease
    #[arg(long)]
    prerelease: bool,

    /// Require the changelog even if disabled in the configuration
    #[arg(long, conflicts_with = "no_changelog")]
    changelog: bool,

    /// Skip the changelog
    #[arg(long)]
    no_changelog: bool,

    /// Build everything but do not publish
    #[arg(long)]
    dry_run: bool,
}

impl ReleaseArgs {
    fn to_request(&self) -> ReleaseRequest {
        let changelog = if self.changelog {
            ChangelogMode::Required
        } else if self.no_changelog {
            ChangelogMode::Skip
        } else {
            ChangelogMode::Auto
        };
        ReleaseRequest {
            tag: self.tag.clone(),
            repo: self.repo.clone(),
            title: self.title.clone(),
            draft: self.draft,
            prerelease: self.prerelease,
            changelog,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipyard_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Release(args) => cmd_release(&cli.config, &args, cli.json).await,
        Commands::Changelog { release_version } => {
            cmd_changelog(&cli.config, &release_version).await
        }
        Commands::Build { release_version } => {
            cmd_build(&cli.config, &release_version, cli.json).await
        }
        Commands::Init { force } => cmd_init(&cli.config, force),
    }
}

fn project_dir_name() -> Result<String> {
    let dir = std::env::current_dir().context("Failed to read current directory")?;
    Ok(dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string()))
}

/// Load the configuration, falling back to defaults when the file is absent.
fn load_config(path: &Path) -> Result<ShipyardConfig> {
    if path.exists() {
        return ShipyardConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }
    warn!(path = %path.display(), "configuration file not found; using defaults");
    let config = ShipyardConfig::for_project(&project_dir_name()?);
    config.validate().context("Default configuration is invalid")?;
    Ok(config)
}

fn orchestrator(config: ShipyardConfig) -> ReleaseOrchestrator {
    let compiler = CommandCompiler::new(config.build.compiler.clone());
    ReleaseOrchestrator::new(config, Arc::new(GitLog::new(".")), Arc::new(compiler))
}

/// GitHub host for the repository the release targets.
fn github_host(config: &ShipyardConfig, repo: Option<&str>) -> Result<Arc<dyn ReleaseHost>> {
    let repo = repo
        .or(config.github.default_repo.as_deref())
        .context("No repository given: pass --repo or set github.defaultRepo")?;
    let repo = parse_repo_ref(repo)?;
    let client = GitHubClient::from_config(&config.github)
        .context("Failed to set up the GitHub client")?;
    Ok(Arc::new(RepoScopedClient::new(client, repo.owner, repo.name)))
}

async fn cmd_release(config_path: &Path, args: &ReleaseArgs, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let request = args.to_request();

    let host = if request.dry_run {
        None
    } else {
        Some(github_host(&config, request.repo.as_deref())?)
    };
    let mut orchestrator = orchestrator(config);
    if let Some(host) = host {
        orchestrator = orchestrator.with_host(host);
    }

    let report = orchestrator.run(&request).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        print!("{}", report.render_text());
    }

    match &report.failure {
        None => Ok(()),
        Some(failure) => bail!("release {} failed at the {} stage", report.tag, failure.stage),
    }
}

async fn cmd_changelog(config_path: &Path, version: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let orchestrator = orchestrator(config);

    let outcome = orchestrator
        .generate_changelog(version, ChangelogMode::Required)
        .await
        .context("Failed to generate changelog")?;
    if let Some(outcome) = outcome {
        println!(
            "Wrote {} entries to {}",
            outcome.changelog.entry_count(),
            outcome.path.display()
        );
    }
    Ok(())
}

async fn cmd_build(config_path: &Path, version: &str, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let orchestrator = orchestrator(config);

    let report = orchestrator.build(version).await.context("Build failed")?;
    print_build(&report, json)?;
    if !report.is_success() {
        bail!("build failed for: {}", report.failed_platforms().join(", "));
    }
    Ok(())
}

fn print_build(report: &BuildReport, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "output_dir": report.output_dir,
            "artifacts": report.artifacts,
            "failed_platforms": report.failed_platforms(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let mut artifacts: Vec<_> = report.artifacts.iter().collect();
    artifacts.sort_by_key(|a| a.file_name());
    for artifact in artifacts {
        println!(
            "{}  {} ({} bytes)",
            artifact.sha256,
            artifact.path.display(),
            artifact.size_bytes
        );
    }
    for failure in &report.failures {
        println!("FAILED {}:\n{}", failure.platform, failure.diagnostics.trim_end());
    }
    Ok(())
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let config = ShipyardConfig::for_project(&project_dir_name()?);
    config
        .save(config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    info!(path = %config_path.display(), "wrote configuration");
    println!("Created {}", config_path.display());
    Ok(())
}
