use tracing::{debug, warn};

use super::CveReport;
use crate::cache::ReportCache;
use crate::config::CveTarget;
use crate::error::{Error, Result};

pub(crate) const USER_AGENT: &str = concat!("apprelease-exporter/", env!("CARGO_PKG_VERSION"));

/// Client for a cve-search instance with an optional on-disk cache.
pub struct CveClient {
    client: reqwest::Client,
    base_url: String,
    cache: Option<ReportCache>,
}

impl CveClient {
    /// Creates a client for the cve-search instance at `base_url`.
    ///
    /// Without a cache every call goes to the remote service and there is
    /// nothing to fall back on when it fails.
    pub fn new(base_url: impl Into<String>, cache: Option<ReportCache>) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            cache,
        })
    }

    /// Fetches the report for `target`.
    ///
    /// Lookup order:
    /// 1. cache entry younger than the TTL
    /// 2. remote search, written back to the cache on success
    /// 3. cache entry of any age, only if the remote call failed
    ///
    /// Returns `Ok(None)` when the remote call failed and no readable cache
    /// entry exists; the caller then proceeds without CVE data. Unreadable
    /// cache entries are logged and treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote service answers with a payload that
    /// is not a valid search result.
    pub async fn fetch_report(&self, target: &CveTarget) -> Result<Option<CveReport>> {
        if let Some(report) = self.fresh_cached(target) {
            return Ok(Some(report));
        }

        match self.fetch_remote(target).await {
            Ok(payload) => {
                let report = CveReport::parse(target, &payload)?;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.write(&target.vendor, &target.product, &payload) {
                        warn!(
                            vendor = %target.vendor,
                            product = %target.product,
                            error = %e,
                            "failed to write cve cache"
                        );
                    }
                }
                Ok(Some(report))
            }
            Err(e) if e.is_upstream() => {
                warn!(
                    vendor = %target.vendor,
                    product = %target.product,
                    error = %e,
                    "cve search failed, falling back to cached report"
                );
                self.stale_cached(target)
            }
            Err(e) => Err(e),
        }
    }

    fn fresh_cached(&self, target: &CveTarget) -> Option<CveReport> {
        let cache = self.cache.as_ref()?;

        let payload = match cache.read_fresh(&target.vendor, &target.product) {
            Ok(payload) => payload?,
            Err(e) => {
                warn!(
                    path = %cache.path_for(&target.vendor, &target.product).display(),
                    error = %e,
                    "failed to read cve cache"
                );
                return None;
            }
        };

        match CveReport::parse(target, &payload) {
            Ok(report) => {
                debug!(vendor = %target.vendor, product = %target.product, "cve cache hit");
                Some(report)
            }
            Err(e) => {
                warn!(
                    path = %cache.path_for(&target.vendor, &target.product).display(),
                    error = %e,
                    "ignoring unreadable cve cache entry"
                );
                None
            }
        }
    }

    fn stale_cached(&self, target: &CveTarget) -> Result<Option<CveReport>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        match cache.read_stale(&target.vendor, &target.product) {
            Ok(Some(payload)) => match CveReport::parse(target, &payload) {
                Ok(report) => Ok(Some(report)),
                Err(e) => {
                    warn!(
                        path = %cache.path_for(&target.vendor, &target.product).display(),
                        error = %e,
                        "ignoring unreadable stale cve cache entry"
                    );
                    Ok(None)
                }
            },
            Ok(None) => {
                warn!(
                    vendor = %target.vendor,
                    product = %target.product,
                    "no cached cve report available"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(
                    path = %cache.path_for(&target.vendor, &target.product).display(),
                    error = %e,
                    "failed to read cve cache"
                );
                Ok(None)
            }
        }
    }

    async fn fetch_remote(&self, target: &CveTarget) -> Result<Vec<u8>> {
        let url = format!(
            "{}/api/search/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&target.vendor),
            urlencoding::encode(&target.product)
        );

        debug!(%url, "fetching cve report");
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Status {
                url,
                status: response.status(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
