//! Docker Registry HTTP API v2 client.
//!
//! Only the two calls the Docker collector needs are implemented: listing
//! the tags of an image and reading the creation time of a tag from its
//! schema-1 manifest history. Registries that answer with a bearer-token
//! challenge (Docker Hub, most hosted registries) are handled by fetching a
//! token from the advertised realm and retrying once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, LINK, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::config::RegistryCredentials;
use crate::cve::USER_AGENT;
use crate::error::{Error, Result};

const MANIFEST_V1_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws, \
                                  application/vnd.docker.distribution.manifest.v1+json";

/// Upper bound on followed `Link: rel="next"` pages per tag listing.
const MAX_TAG_PAGES: usize = 100;

/// Source of image tags and their creation times.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Lists every tag of `image`.
    async fn tags(&self, image: &str) -> Result<Vec<String>>;

    /// Returns the latest creation time recorded in the manifest history of
    /// `image:tag`, or `None` if the manifest carries none.
    async fn manifest_created(&self, image: &str, tag: &str) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Entries stay untyped so one malformed entry cannot fail the whole
/// manifest.
#[derive(Deserialize)]
struct ManifestV1 {
    #[serde(default)]
    history: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct V1Compatibility {
    created: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// [`RegistryClient`] talking to a registry over HTTP.
pub struct HttpRegistryClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpRegistryClient {
    /// Creates a client for the registry and credentials in `credentials`.
    /// An empty username means anonymous access.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(credentials: &RegistryCredentials) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            client,
            base_url: credentials.url.trim_end_matches('/').to_string(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    fn cached_token(&self, image: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image)
            .cloned()
    }

    async fn send(&self, image: &str, url: &str, accept: Option<&str>) -> Result<reqwest::Response> {
        let response = self.request(image, url, accept).send().await?;

        let challenge = match response.status() {
            StatusCode::UNAUTHORIZED => bearer_challenge(response.headers()),
            _ => None,
        };

        let response = match challenge {
            Some(challenge) => {
                let token = self.fetch_token(&challenge).await?;
                self.tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(image.to_string(), token);
                self.request(image, url, accept).send().await?
            }
            None => response,
        };

        if !response.status().is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        Ok(response)
    }

    fn request(&self, image: &str, url: &str, accept: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        if let Some(token) = self.cached_token(image) {
            request.bearer_auth(token)
        } else if self.has_credentials() {
            request.basic_auth(&self.username, Some(&self.password))
        } else {
            request
        }
    }

    async fn fetch_token(&self, challenge: &HashMap<String, String>) -> Result<String> {
        let realm = challenge
            .get("realm")
            .ok_or_else(|| Error::Upstream("bearer challenge without realm".to_string()))?;

        let query: Vec<(&str, &str)> = ["service", "scope"]
            .into_iter()
            .filter_map(|key| challenge.get(key).map(|value| (key, value.as_str())))
            .collect();

        debug!(%realm, "requesting registry token");
        let mut request = self.client.get(realm).query(&query);
        if self.has_credentials() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                url: realm.clone(),
                status: response.status(),
            });
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| Error::Upstream(format!("token endpoint {} returned no token", realm)))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn tags(&self, image: &str) -> Result<Vec<String>> {
        let mut url = format!("{}/v2/{}/tags/list", self.base_url, image);
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let response = self.send(image, &url, None).await?;
            let next = next_link(response.headers(), &url);
            let page: TagList = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = next,
                None => return Ok(tags),
            }
        }

        warn!(image, pages = MAX_TAG_PAGES, "tag listing truncated");
        Ok(tags)
    }

    async fn manifest_created(&self, image: &str, tag: &str) -> Result<Option<DateTime<Utc>>> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, image, tag);
        let response = self.send(image, &url, Some(MANIFEST_V1_ACCEPT)).await?;
        let manifest: ManifestV1 = response.json().await?;

        Ok(latest_created(image, tag, &manifest.history))
    }
}

/// Latest `created` timestamp across all history entries. Entries that do
/// not parse are logged and skipped.
fn latest_created(image: &str, tag: &str, history: &[serde_json::Value]) -> Option<DateTime<Utc>> {
    history
        .iter()
        .filter_map(|entry| {
            let Some(raw) = entry.get("v1Compatibility").and_then(|v| v.as_str()) else {
                warn!(image, tag, "skipping manifest history entry without v1Compatibility");
                return None;
            };

            match serde_json::from_str::<V1Compatibility>(raw) {
                Ok(compat) => Some(compat.created),
                Err(e) => {
                    warn!(image, tag, error = %e, "skipping malformed manifest history entry");
                    None
                }
            }
        })
        .max()
}

/// Parses a `WWW-Authenticate: Bearer k="v",...` header into its parameters.
fn bearer_challenge(headers: &HeaderMap) -> Option<HashMap<String, String>> {
    let value = headers.get(WWW_AUTHENTICATE)?.to_str().ok()?;
    let (scheme, params) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let challenge = split_unquoted(params, ',')
        .into_iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect();

    Some(challenge)
}

/// Splits on `separator` outside of double quotes (`scope="a:b:pull,push"`).
fn split_unquoted(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (i, c) in value.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == separator && !in_quotes {
            parts.push(&value[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&value[start..]);

    parts
}

/// Resolves the `rel="next"` target of a `Link` header against `current`.
fn next_link(headers: &HeaderMap, current: &str) -> Option<String> {
    let value = headers.get(LINK)?.to_str().ok()?;

    value.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        Url::parse(current).ok()?.join(target).ok().map(String::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(url: &str, username: &str) -> RegistryCredentials {
        RegistryCredentials {
            url: format!("{}/", url),
            username: username.to_string(),
            password: if username.is_empty() { String::new() } else { "pw".to_string() },
        }
    }

    fn history(created: &[&str]) -> serde_json::Value {
        let entries: Vec<_> = created
            .iter()
            .map(|c| json!({ "v1Compatibility": json!({ "id": "x", "created": c }).to_string() }))
            .collect();
        json!({ "schemaVersion": 1, "history": entries })
    }

    #[test]
    fn test_bearer_challenge_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(
                r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:team/app:pull,push""#,
            ),
        );

        let challenge = bearer_challenge(&headers).unwrap();
        assert_eq!(challenge["realm"], "https://auth.example.com/token");
        assert_eq!(challenge["service"], "registry.example.com");
        assert_eq!(challenge["scope"], "repository:team/app:pull,push");
    }

    #[test]
    fn test_basic_challenge_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static(r#"Basic realm="x""#));

        assert!(bearer_challenge(&headers).is_none());
    }

    #[test]
    fn test_next_link_is_resolved() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(r#"</v2/team/app/tags/list?last=b&n=2>; rel="next""#),
        );

        assert_eq!(
            next_link(&headers, "https://registry.example.com/v2/team/app/tags/list").as_deref(),
            Some("https://registry.example.com/v2/team/app/tags/list?last=b&n=2")
        );
        assert!(next_link(&HeaderMap::new(), "https://registry.example.com/").is_none());
    }

    #[tokio::test]
    async fn test_tags_follow_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/tags/list"))
            .and(query_param("last", "b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "team/app", "tags": ["c"]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/tags/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", r#"</v2/team/app/tags/list?last=b>; rel="next""#)
                    .set_body_json(json!({"name": "team/app", "tags": ["a", "b"]})),
            )
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(&credentials(&server.uri(), "")).unwrap();

        assert_eq!(client.tags("team/app").await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_manifest_latest_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(history(&[
                "2020-01-01T00:00:00Z",
                "2021-06-01T12:00:00.123456789Z",
                "2019-01-01T00:00:00Z",
            ])))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(&credentials(&server.uri(), "")).unwrap();
        let created = client.manifest_created("team/app", "1.0").await.unwrap().unwrap();

        assert_eq!(created.to_rfc3339(), "2021-06-01T12:00:00.123456789+00:00");
    }

    #[tokio::test]
    async fn test_manifest_without_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"schemaVersion": 2})))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(&credentials(&server.uri(), "")).unwrap();

        assert!(client.manifest_created("team/app", "2.0").await.unwrap().is_none());
    }

    #[test]
    fn test_malformed_history_entry_is_skipped() {
        let entries = vec![
            json!({ "v1Compatibility": "{not json" }),
            json!({ "v1Compatibility": r#"{"created":"2022-02-02T00:00:00Z"}"# }),
            json!({ "v1Compatibility": r#"{"id":"no-created"}"# }),
            json!({ "v1Compatibility": 42 }),
            json!("not an object"),
        ];

        let created = latest_created("team/app", "1.0", &entries).unwrap();
        assert_eq!(created.to_rfc3339(), "2022-02-02T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_bearer_token_flow() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/tags/list"))
            .and(header("Authorization", "Bearer tok123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tags": ["1.0"]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/tags/list"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(
                    r#"Bearer realm="{}/token",service="test",scope="repository:team/app:pull""#,
                    server.uri()
                )
                .as_str(),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "test"))
            .and(query_param("scope", "repository:team/app:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok123"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(&credentials(&server.uri(), "bot")).unwrap();

        assert_eq!(client.tags("team/app").await.unwrap(), vec!["1.0"]);
        // token is reused for the next call
        assert_eq!(client.tags("team/app").await.unwrap(), vec!["1.0"]);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(&credentials(&server.uri(), "")).unwrap();
        let err = client.tags("team/missing").await.unwrap_err();

        assert!(matches!(err, Error::Status { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_history_entry_without_v1_compatibility_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/3.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schemaVersion": 1,
                "history": [
                    {"v1Compatibility": json!({"created": "2021-01-01T00:00:00Z"}).to_string()},
                    {"somethingElse": "x"}
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpRegistryClient::new(&credentials(&server.uri(), "")).unwrap();
        let created = client.manifest_created("team/app", "3.0").await.unwrap().unwrap();

        assert_eq!(created.to_rfc3339(), "2021-01-01T00:00:00+00:00");
    }
}
