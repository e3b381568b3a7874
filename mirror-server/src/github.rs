//! Thin client for the slice of the GitHub REST API the mirror consumes.
//!
//! Every list call returns its items together with [`Page`] metadata: the
//! last available page (from the `Link` header) and the quota state (from
//! the rate-limit headers). A response arriving with an exhausted quota is
//! surfaced as [`ApiError::RateLimited`] without delivering items, so the
//! retry layer can sleep until the reported reset and re-issue the request;
//! this covers both the 403 and the successful-but-exhausted case.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

use mirror_core::github::{GitRef, Hook, IssueComment, PullRequest, PullRequestComment, RepoStatus};

const API_BASE: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github.v3+json";
const SCOPES_HEADER: &str = "x-oauth-scopes";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited until {reset}")]
    RateLimited { reset: DateTime<Utc> },
    #[error("GitHub API error: {status} - {body}")]
    Status { status: StatusCode, body: String },
    #[error("exceeded the maximum of {0} retry attempts")]
    TooManyRetries(usize),
    #[error("remote repository requires owner and name")]
    InvalidRemoteRepo,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// The provider's quota state, reported alongside every response.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub remaining: u32,
    pub reset: DateTime<Utc>,
}

/// Pagination metadata for a list response. `last_page` is zero when the
/// response carried no `Link` header, meaning there is only this page.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub last_page: u32,
    pub rate: Rate,
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub page: u32,
    pub per_page: u32,
}

/// The list endpoints the fetch pipeline reads, behind a trait so the
/// pipeline can be exercised against stubs.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    async fn list_refs(
        &self,
        owner: &str,
        repo: &str,
        opts: ListOptions,
    ) -> Result<(Vec<GitRef>, Page), ApiError>;

    async fn list_statuses(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        opts: ListOptions,
    ) -> Result<(Vec<RepoStatus>, Page), ApiError>;

    async fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        opts: ListOptions,
    ) -> Result<(Vec<PullRequest>, Page), ApiError>;

    async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        opts: ListOptions,
    ) -> Result<(Vec<IssueComment>, Page), ApiError>;

    async fn list_diff_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        opts: ListOptions,
    ) -> Result<(Vec<PullRequestComment>, Page), ApiError>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: Option<String>,
    base_url: String,
}

pub fn create_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("github-notes-mirror/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client")
}

impl GitHubClient {
    pub fn new(client: reqwest::Client, token: Option<String>) -> Self {
        Self {
            client,
            token,
            base_url: API_BASE.to_string(),
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Accept", ACCEPT_JSON);
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn get_raw(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(HeaderMap, Vec<u8>), ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .apply_auth(self.client.get(&url).query(query))
            .send()
            .await?;

        let rate = parse_rate(response.headers());
        if rate.remaining == 0 {
            return Err(ApiError::RateLimited { reset: rate.reset });
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok((headers, body.to_vec()))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        mut query: Vec<(&str, String)>,
        opts: ListOptions,
    ) -> Result<(Vec<T>, Page), ApiError> {
        query.push(("page", opts.page.to_string()));
        query.push(("per_page", opts.per_page.to_string()));
        let (headers, body) = self.get_raw(path, &query).await?;
        let items = serde_json::from_slice(&body).map_err(|e| ApiError::Status {
            status: StatusCode::OK,
            body: format!("unparseable response body: {}", e),
        })?;
        let page = Page {
            last_page: parse_last_page(headers.get("link").and_then(|v| v.to_str().ok())),
            rate: parse_rate(&headers),
        };
        Ok((items, page))
    }

    /// Probe the token: the granted scopes arrive in a response header on
    /// any authenticated call. `None` means the header was absent, which
    /// GitHub uses for tokens restricted to public data.
    pub async fn granted_scopes(&self) -> Result<Option<String>, ApiError> {
        let (headers, _) = self.get_raw("/user", &[]).await?;
        Ok(headers
            .get(SCOPES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()))
    }

    /// Login of the authenticated user; used as a cheap token probe.
    pub async fn current_user(&self) -> Result<String, ApiError> {
        let (_, body) = self.get_raw("/user", &[]).await?;
        let user: mirror_core::github::User =
            serde_json::from_slice(&body).map_err(|e| ApiError::Status {
                status: StatusCode::OK,
                body: format!("unparseable response body: {}", e),
            })?;
        Ok(user.login.unwrap_or_default())
    }

    /// Confirm the repository exists and the token can see it.
    pub async fn get_repository(&self, owner: &str, repo: &str) -> Result<(), ApiError> {
        self.get_raw(&format!("/repos/{}/{}", owner, repo), &[])
            .await?;
        Ok(())
    }

    pub async fn create_hook(
        &self,
        owner: &str,
        repo: &str,
        events: &[&str],
        hook_url: &str,
        secret: &str,
    ) -> Result<Hook, ApiError> {
        let url = format!("{}/repos/{}/{}/hooks", self.base_url, owner, repo);
        info!("Creating hook for {}/{}: url {:?}", owner, repo, hook_url);

        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": events,
            "config": {
                "url": hook_url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": false,
            },
        });

        let response = self
            .apply_auth(self.client.post(&url).json(&body))
            .send()
            .await?;
        let rate = parse_rate(response.headers());
        if rate.remaining == 0 {
            return Err(ApiError::RateLimited { reset: rate.reset });
        }
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Status {
            status,
            body: format!("unparseable hook response: {}", e),
        })
    }

    pub async fn delete_hook(&self, owner: &str, repo: &str, hook_id: u64) -> Result<(), ApiError> {
        let url = format!("{}/repos/{}/{}/hooks/{}", self.base_url, owner, repo, hook_id);
        let response = self.apply_auth(self.client.delete(&url)).send().await?;
        let rate = parse_rate(response.headers());
        if rate.remaining == 0 {
            return Err(ApiError::RateLimited { reset: rate.reset });
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl GitHubApi for GitHubClient {
    async fn list_refs(
        &self,
        owner: &str,
        repo: &str,
        opts: ListOptions,
    ) -> Result<(Vec<GitRef>, Page), ApiError> {
        self.get_list(&format!("/repos/{}/{}/git/refs", owner, repo), Vec::new(), opts)
            .await
    }

    async fn list_statuses(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        opts: ListOptions,
    ) -> Result<(Vec<RepoStatus>, Page), ApiError> {
        self.get_list(
            &format!("/repos/{}/{}/commits/{}/statuses", owner, repo, sha),
            Vec::new(),
            opts,
        )
        .await
    }

    async fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        opts: ListOptions,
    ) -> Result<(Vec<PullRequest>, Page), ApiError> {
        self.get_list(
            &format!("/repos/{}/{}/pulls", owner, repo),
            vec![("state", "all".to_string())],
            opts,
        )
        .await
    }

    async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        opts: ListOptions,
    ) -> Result<(Vec<IssueComment>, Page), ApiError> {
        self.get_list(
            &format!("/repos/{}/{}/issues/{}/comments", owner, repo, number),
            Vec::new(),
            opts,
        )
        .await
    }

    async fn list_diff_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        opts: ListOptions,
    ) -> Result<(Vec<PullRequestComment>, Page), ApiError> {
        self.get_list(
            &format!("/repos/{}/{}/pulls/{}/comments", owner, repo, number),
            Vec::new(),
            opts,
        )
        .await
    }
}

fn parse_rate(headers: &HeaderMap) -> Rate {
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);
    Rate { remaining, reset }
}

/// Pull the rel="last" page number out of a `Link` header, zero if absent.
fn parse_last_page(link: Option<&str>) -> u32 {
    let Some(link) = link else { return 0 };
    for part in link.split(',') {
        let mut sections = part.split(';');
        let url = sections.next().unwrap_or("").trim();
        if !sections.any(|s| s.trim() == "rel=\"last\"") {
            continue;
        }
        let url = url.trim_start_matches('<').trim_end_matches('>');
        let Some((_, query)) = url.split_once('?') else {
            continue;
        };
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("page=") {
                return value.parse().unwrap_or(0);
            }
        }
    }
    0
}
