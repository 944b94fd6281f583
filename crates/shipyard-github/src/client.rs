//! GitHub Releases REST client
//!
//! Implements [`ReleaseHost`] against `POST /repos/{owner}/{repo}/releases`
//! and the uploads endpoint for release assets.

use crate::error::{GitHubError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use shipyard_core::config::GitHubConfig;
use shipyard_core::{AssetPayload, HostError, ReleaseDraft, ReleaseHost};
use std::time::Duration;
use tracing::{debug, info};

const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";

/// Connection settings for [`GitHubClient`].
#[derive(Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub uploads_url: String,
    pub token: String,
    /// Bound on the create call. Uploads are bounded only by connect time.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("api_url", &self.api_url)
            .field("uploads_url", &self.uploads_url)
            .field("token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ClientSettings {
    /// Settings from the `github` configuration section, with the token read
    /// from the environment variable it names.
    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GitHubError::MissingToken(config.token_env.clone()))?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            uploads_url: config.uploads_url.trim_end_matches('/').to_string(),
            token,
            request_timeout: Duration::from_secs(30),
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateReleaseBody<'a> {
    tag_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_commitish: Option<&'a str>,
    name: &'a str,
    body: &'a str,
    draft: bool,
    prerelease: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedRelease {
    id: u64,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: String,
}

/// GitHub Releases client
pub struct GitHubClient {
    settings: ClientSettings,
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("shipyard/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { settings, http })
    }

    /// Client for the `github` configuration section.
    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        Self::new(ClientSettings::from_config(config)?)
    }

    fn releases_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{owner}/{repo}/releases", self.settings.api_url)
    }

    fn assets_url(&self, owner: &str, repo: &str, release_id: u64) -> String {
        format!(
            "{}/repos/{owner}/{repo}/releases/{release_id}/assets",
            self.settings.uploads_url
        )
    }

    /// Create a release and return its id.
    pub async fn create(&self, draft: &ReleaseDraft) -> Result<u64> {
        let url = self.releases_url(&draft.owner, &draft.repo_name);
        debug!(url = %url, tag = %draft.version_tag, "creating GitHub release");

        let body = CreateReleaseBody {
            tag_name: &draft.version_tag,
            target_commitish: draft.target_commitish.as_deref(),
            name: &draft.title,
            body: &draft.body,
            draft: draft.draft,
            prerelease: draft.prerelease,
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.token)
            .header(ACCEPT, ACCEPT_GITHUB_JSON)
            .header(API_VERSION_HEADER, API_VERSION)
            .timeout(self.settings.request_timeout)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let created: CreatedRelease = response
            .json()
            .await
            .map_err(|e| GitHubError::InvalidResponse(e.to_string()))?;
        info!(
            tag = %draft.version_tag,
            id = created.id,
            url = created.html_url.as_deref().unwrap_or(""),
            "GitHub release created"
        );
        Ok(created.id)
    }

    /// Stream `payload` as asset `name` of release `release_id`.
    pub async fn upload(
        &self,
        owner: &str,
        repo: &str,
        release_id: u64,
        name: &str,
        payload: AssetPayload,
    ) -> Result<()> {
        let url = self.assets_url(owner, repo, release_id);
        debug!(url = %url, asset = %name, bytes = payload.length, "uploading release asset");

        let response = self
            .http
            .post(&url)
            .query(&[("name", name)])
            .bearer_auth(&self.settings.token)
            .header(ACCEPT, ACCEPT_GITHUB_JSON)
            .header(API_VERSION_HEADER, API_VERSION)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, payload.length)
            .body(reqwest::Body::from(payload.file))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Pass through success responses; turn everything else into a
/// [`GitHubError`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(error_for_status(status, &text))
}

fn error_for_status(status: StatusCode, body: &str) -> GitHubError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        parsed.message.clone()
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GitHubError::Unauthorized(message),
        StatusCode::UNPROCESSABLE_ENTITY
            if parsed.errors.iter().any(|e| e.code == "already_exists") =>
        {
            GitHubError::AlreadyExists(message)
        }
        _ => GitHubError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

/// [`ReleaseHost`] for one repository.
///
/// Upload calls only carry the release id, so the client is bound to the
/// owner and repository it publishes to.
pub struct RepoScopedClient {
    client: GitHubClient,
    owner: String,
    repo: String,
}

impl RepoScopedClient {
    pub fn new(client: GitHubClient, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            client,
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

#[async_trait]
impl ReleaseHost for RepoScopedClient {
    async fn create_release(&self, draft: &ReleaseDraft) -> std::result::Result<u64, HostError> {
        if draft.owner != self.owner || draft.repo_name != self.repo {
            return Err(HostError::Other(format!(
                "client is bound to {}/{}, not {}/{}",
                self.owner, self.repo, draft.owner, draft.repo_name
            )));
        }
        self.client
            .create(draft)
            .await
            .map_err(GitHubError::into_create_error)
    }

    async fn upload_asset(
        &self,
        release_id: u64,
        name: &str,
        payload: AssetPayload,
    ) -> std::result::Result<(), HostError> {
        self.client
            .upload(&self.owner, &self.repo, release_id, name, payload)
            .await
            .map_err(GitHubError::into_upload_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Captured {
        head: String,
        body: Vec<u8>,
    }

    /// Accept one connection, capture the request, answer with `status` and
    /// `body`.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                assert!(n > 0, "connection closed before headers");
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let length = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while buf.len() < header_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before body");
                buf.extend_from_slice(&chunk[..n]);
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            Captured {
                head,
                body: buf[header_end..header_end + length].to_vec(),
            }
        });
        (addr, handle)
    }

    fn client(base: &str) -> RepoScopedClient {
        let settings = ClientSettings {
            api_url: base.to_string(),
            uploads_url: base.to_string(),
            token: "secret-token".to_string(),
            request_timeout: Duration::from_secs(5),
        };
        RepoScopedClient::new(GitHubClient::new(settings).unwrap(), "acme", "tool")
    }

    fn draft() -> ReleaseDraft {
        ReleaseDraft {
            owner: "acme".to_string(),
            repo_name: "tool".to_string(),
            version_tag: "v1.0.0".to_string(),
            title: "Tool v1.0.0".to_string(),
            body: "notes".to_string(),
            draft: true,
            prerelease: false,
            target_commitish: Some("main".to_string()),
        }
    }

    #[test]
    fn settings_debug_hides_token() {
        let settings = ClientSettings {
            api_url: "https://api.github.com".to_string(),
            uploads_url: "https://uploads.github.com".to_string(),
            token: "secret-token".to_string(),
            request_timeout: Duration::from_secs(1),
        };
        assert!(!format!("{settings:?}").contains("secret-token"));
    }

    #[test]
    fn missing_token_env_is_reported() {
        let config = GitHubConfig {
            token_env: "SHIPYARD_TEST_TOKEN_THAT_IS_NOT_SET".to_string(),
            ..GitHubConfig::default()
        };
        let err = ClientSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, GitHubError::MissingToken(ref v) if v == "SHIPYARD_TEST_TOKEN_THAT_IS_NOT_SET"));
    }

    #[test]
    fn status_mapping() {
        let dup = error_for_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"Validation Failed","errors":[{"resource":"Release","code":"already_exists","field":"tag_name"}]}"#,
        );
        assert!(matches!(dup, GitHubError::AlreadyExists(ref m) if m == "Validation Failed"));

        let invalid = error_for_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"Validation Failed","errors":[{"code":"invalid"}]}"#,
        );
        assert!(matches!(invalid, GitHubError::Api { status: 422, .. }));

        let auth = error_for_status(StatusCode::UNAUTHORIZED, r#"{"message":"Bad credentials"}"#);
        assert!(matches!(auth, GitHubError::Unauthorized(ref m) if m == "Bad credentials"));

        let plain = error_for_status(StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(plain, GitHubError::Api { status: 502, ref message } if message == "Bad Gateway"));
    }

    #[tokio::test]
    async fn create_posts_release_json() {
        let (base, server) = serve_once("201 Created", r#"{"id":42,"html_url":"https://github.com/acme/tool/releases/v1.0.0"}"#).await;

        let id = client(&base).create_release(&draft()).await.unwrap();
        assert_eq!(id, 42);

        let captured = server.await.unwrap();
        assert!(captured.head.starts_with("POST /repos/acme/tool/releases HTTP/1.1"));
        assert!(captured
            .head
            .to_ascii_lowercase()
            .contains("authorization: bearer secret-token"));
        let sent: serde_json::Value = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(sent["tag_name"], "v1.0.0");
        assert_eq!(sent["name"], "Tool v1.0.0");
        assert_eq!(sent["target_commitish"], "main");
        assert_eq!(sent["draft"], true);
    }

    #[tokio::test]
    async fn duplicate_tag_is_a_duplicate_host_error() {
        let (base, server) = serve_once(
            "422 Unprocessable Entity",
            r#"{"message":"Validation Failed","errors":[{"code":"already_exists"}]}"#,
        )
        .await;

        let err = client(&base).create_release(&draft()).await.unwrap_err();
        assert!(matches!(err, HostError::Duplicate(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn upload_streams_file_as_octet_stream() {
        let (base, server) = serve_once("201 Created", r#"{"id":7,"name":"tool_linux_amd64"}"#).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool_linux_amd64");
        std::fs::write(&path, b"ELF-binary-bytes").unwrap();
        let file = tokio::fs::File::open(&path).await.unwrap();

        client(&base)
            .upload_asset(
                42,
                "tool_linux_amd64",
                AssetPayload {
                    file,
                    length: 16,
                },
            )
            .await
            .unwrap();

        let captured = server.await.unwrap();
        assert!(captured
            .head
            .starts_with("POST /repos/acme/tool/releases/42/assets?name=tool_linux_amd64 HTTP/1.1"));
        let head = captured.head.to_ascii_lowercase();
        assert!(head.contains("content-type: application/octet-stream"));
        assert!(head.contains("content-length: 16"));
        assert_eq!(captured.body, b"ELF-binary-bytes");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = client(&base).create_release(&draft()).await.unwrap_err();
        assert!(matches!(err, HostError::Network(_)));
    }

    #[tokio::test]
    async fn mismatched_repository_is_rejected_locally() {
        let mut other = draft();
        other.repo_name = "other".to_string();
        let err = client("http://127.0.0.1:9")
            .create_release(&other)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Other(ref m) if m.contains("acme/tool")));
    }
}
