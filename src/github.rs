//! Minimal GitHub REST client for commit lookups and hook deliveries.
//!
//! Requests are unauthenticated (and rate limited) when no token is given.

use std::fmt;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::{HookInfo, WebhookDelivery, WebhookDeliveryDetail};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Annotated tags can point at other tags; give up after this many hops.
const MAX_TAG_DEPTH: usize = 5;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("tag {0} does not resolve to a commit")]
    UnresolvedTag(String),
}

/// Owner of a hook: a single repository or a whole organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOwner {
    /// `owner/name`
    Repo(String),
    Org(String),
}

impl HookOwner {
    fn path(&self) -> String {
        match self {
            HookOwner::Repo(repo) => format!("repos/{repo}"),
            HookOwner::Org(org) => format!("orgs/{org}"),
        }
    }
}

impl fmt::Display for HookOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookOwner::Repo(repo) => write!(f, "{repo}"),
            HookOwner::Org(org) => write!(f, "org {org}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: GitObject,
}

impl GitHubClient {
    pub fn new(api_base: impl Into<String>, token: Option<&str>) -> Result<Self, GitHubError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(concat!("hookrelay/", env!("CARGO_PKG_VERSION"))));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GitHubError::InvalidToken(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|source| GitHubError::Http {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<(T, HeaderMap), GitHubError> {
        debug!(url, "GET");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| GitHubError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let headers = resp.headers().clone();
        let data = resp.json().await.map_err(|source| GitHubError::Http {
            url: url.to_string(),
            source,
        })?;
        Ok((data, headers))
    }

    // ─── Commits ─────────────────────────────────────────────────────────────

    /// Full SHA of the newest commit on `branch`.
    pub async fn branch_head(&self, repo: &str, branch: &str) -> Result<String, GitHubError> {
        let url = self.url(&format!("repos/{repo}/commits/{branch}"));
        let (commit, _): (CommitResponse, _) = self.get_json(&url).await?;
        Ok(commit.sha)
    }

    /// Full SHA of the commit a tag points to, following annotated tags.
    pub async fn tag_commit(&self, repo: &str, tag: &str) -> Result<String, GitHubError> {
        let url = self.url(&format!("repos/{repo}/git/ref/tags/{tag}"));
        let (reference, _): (RefResponse, _) = self.get_json(&url).await?;

        let mut object = reference.object;
        for _ in 0..MAX_TAG_DEPTH {
            match object.kind.as_str() {
                "commit" => return Ok(object.sha),
                "tag" => {
                    let url = self.url(&format!("repos/{repo}/git/tags/{}", object.sha));
                    let (annotated, _): (RefResponse, _) = self.get_json(&url).await?;
                    object = annotated.object;
                }
                _ => break,
            }
        }
        Err(GitHubError::UnresolvedTag(tag.to_string()))
    }

    // ─── Hooks ───────────────────────────────────────────────────────────────

    pub async fn list_hooks(&self, owner: &HookOwner) -> Result<Vec<HookInfo>, GitHubError> {
        let url = self.url(&format!("{}/hooks?per_page=100", owner.path()));
        let (hooks, _) = self.get_json(&url).await?;
        Ok(hooks)
    }

    /// URL of the first deliveries page, newest first.
    pub fn deliveries_url(&self, owner: &HookOwner, hook_id: u64) -> String {
        self.url(&format!("{}/hooks/{hook_id}/deliveries?per_page=100", owner.path()))
    }

    /// One page of deliveries and the URL of the next page, if any.
    pub async fn deliveries_page(
        &self,
        url: &str,
    ) -> Result<(Vec<WebhookDelivery>, Option<String>), GitHubError> {
        let (page, headers) = self.get_json(url).await?;
        let next = headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link);
        Ok((page, next))
    }

    pub async fn delivery_detail(
        &self,
        owner: &HookOwner,
        hook_id: u64,
        delivery_id: u64,
    ) -> Result<WebhookDeliveryDetail, GitHubError> {
        let url = self.url(&format!(
            "{}/hooks/{hook_id}/deliveries/{delivery_id}",
            owner.path()
        ));
        let (detail, _) = self.get_json(&url).await?;
        Ok(detail)
    }
}

/// Extracts the `rel="next"` target from a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (url, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let url = url.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(url.to_string())
    })
}

/// First eight characters of a commit hash.
pub fn short_hash(sha: &str) -> String {
    sha.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn link_header_parsing() {
        let h = r#"<https://api.github.com/repositories/1/hooks/2/deliveries?per_page=100&cursor=v1_9>; rel="next""#;
        assert_eq!(
            next_link(h).as_deref(),
            Some("https://api.github.com/repositories/1/hooks/2/deliveries?per_page=100&cursor=v1_9")
        );

        let both = r#"<https://x/prev>; rel="prev", <https://x/next>; rel="next""#;
        assert_eq!(next_link(both).as_deref(), Some("https://x/next"));

        assert_eq!(next_link(r#"<https://x/prev>; rel="prev""#), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn short_hash_truncates() {
        assert_eq!(short_hash("0123456789abcdef"), "01234567");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[tokio::test]
    async fn branch_head_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/commits/main"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "aaaa1111bbbb2222cccc3333dddd4444eeee5555"
            })))
            .mount(&server)
            .await;

        let client = GitHubClient::new(server.uri(), Some("t0ken")).unwrap();
        let sha = client.branch_head("o/r", "main").await.unwrap();
        assert_eq!(sha, "aaaa1111bbbb2222cccc3333dddd4444eeee5555");
    }

    #[tokio::test]
    async fn annotated_tag_is_dereferenced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/git/ref/tags/v1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ref": "refs/tags/v1.0.0",
                "object": {"sha": "tagobject", "type": "tag"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/git/tags/tagobject"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tag": "v1.0.0",
                "object": {"sha": "commit0001", "type": "commit"}
            })))
            .mount(&server)
            .await;

        let client = GitHubClient::new(server.uri(), None).unwrap();
        assert_eq!(client.tag_commit("o/r", "v1.0.0").await.unwrap(), "commit0001");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(server.uri(), None).unwrap();
        match client.branch_head("o/r", "main").await {
            Err(GitHubError::Status { status, body, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "Not Found");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deliveries_page_follows_link() {
        let server = MockServer::start().await;
        let next = format!("{}/repos/o/r/hooks/7/deliveries?per_page=100&cursor=abc", server.uri());
        Mock::given(method("GET"))
            .and(path("/repos/o/r/hooks/7/deliveries"))
            .and(query_param("per_page", "100"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", format!("<{next}>; rel=\"next\"").as_str())
                    .set_body_json(serde_json::json!([{
                        "id": 1,
                        "guid": "g1",
                        "delivered_at": "2024-01-01T00:00:00Z",
                        "event": "push"
                    }])),
            )
            .mount(&server)
            .await;

        let client = GitHubClient::new(server.uri(), None).unwrap();
        let owner = HookOwner::Repo("o/r".into());
        let (page, next_url) = client
            .deliveries_page(&client.deliveries_url(&owner, 7))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].guid, "g1");
        assert_eq!(next_url, Some(next));
    }
}
