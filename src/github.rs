//! GitHub REST API client for releases, tags and commits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::cve::USER_AGENT;
use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// GitHub caps `per_page` at 100.
const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GithubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubTag {
    pub name: String,
    pub commit_sha: String,
}

#[derive(Deserialize)]
struct RawTag {
    name: String,
    commit: RawTagCommit,
}

#[derive(Deserialize)]
struct RawTagCommit {
    sha: String,
}

#[derive(Deserialize)]
struct RawCommit {
    commit: RawCommitDetail,
}

#[derive(Deserialize)]
struct RawCommitDetail {
    author: Option<RawSignature>,
}

#[derive(Deserialize)]
struct RawSignature {
    date: Option<DateTime<Utc>>,
}

/// Source of GitHub releases and tags.
#[async_trait]
pub trait ReleaseClient: Send + Sync {
    /// First page of releases, newest first, `per_page` entries at most.
    async fn releases(&self, owner: &str, repo: &str, per_page: usize) -> Result<Vec<GithubRelease>>;

    /// First page of tags, `per_page` entries at most.
    async fn tags(&self, owner: &str, repo: &str, per_page: usize) -> Result<Vec<GithubTag>>;

    /// Author date of the commit `sha`.
    async fn commit_date(&self, owner: &str, repo: &str, sha: &str) -> Result<DateTime<Utc>>;
}

/// [`ReleaseClient`] backed by the GitHub REST API.
pub struct HttpGithubClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGithubClient {
    /// Creates a client for the API at `base_url`. An empty token is
    /// treated as none.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Calls the API root to check that the configured token is accepted.
    pub async fn verify(&self) -> Result<()> {
        self.get_raw(&format!("{}/", self.base_url), &[]).await?;
        Ok(())
    }

    async fn get_raw(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "github request");
        Ok(self.get_raw(&url, query).await?.json().await?)
    }
}

fn page_query(per_page: usize) -> [(&'static str, String); 2] {
    [
        ("per_page", per_page.clamp(1, MAX_PER_PAGE).to_string()),
        ("page", "1".to_string()),
    ]
}

#[async_trait]
impl ReleaseClient for HttpGithubClient {
    async fn releases(&self, owner: &str, repo: &str, per_page: usize) -> Result<Vec<GithubRelease>> {
        self.get(
            &format!("/repos/{}/{}/releases", owner, repo),
            &page_query(per_page),
        )
        .await
    }

    async fn tags(&self, owner: &str, repo: &str, per_page: usize) -> Result<Vec<GithubTag>> {
        let tags: Vec<RawTag> = self
            .get(&format!("/repos/{}/{}/tags", owner, repo), &page_query(per_page))
            .await?;

        Ok(tags
            .into_iter()
            .map(|tag| GithubTag {
                name: tag.name,
                commit_sha: tag.commit.sha,
            })
            .collect())
    }

    async fn commit_date(&self, owner: &str, repo: &str, sha: &str) -> Result<DateTime<Utc>> {
        let commit: RawCommit = self
            .get(&format!("/repos/{}/{}/commits/{}", owner, repo, sha), &[])
            .await?;

        commit
            .commit
            .author
            .and_then(|author| author.date)
            .ok_or_else(|| Error::Upstream(format!("commit {} of {}/{} has no author date", sha, owner, repo)))
    }
}
