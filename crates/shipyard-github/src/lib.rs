//! GitHub Releases backend for shipyard
//!
//! Creates releases and uploads assets through the GitHub REST API. The
//! authentication token comes from the environment and is never persisted.

pub mod client;
pub mod error;

pub use client::{ClientSettings, GitHubClient, RepoScopedClient};
pub use error::{GitHubError, Result};
