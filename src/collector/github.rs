use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{cancellable, project_cve_report, Collector};
use crate::config::{FetchType, GithubProject};
use crate::cve::CveClient;
use crate::error::{Error, Result};
use crate::github::ReleaseClient;
use crate::metrics::families::{self, cve_labels};
use crate::metrics::{bool_label, MetricFamily, MetricList};
use crate::model::DiscoveredVersion;

/// Collects releases or tags of GitHub repositories.
///
/// Projects are collected one after another with `scrape_wait` between them
/// to stay below the API rate limit.
pub struct GithubCollector {
    projects: Vec<GithubProject>,
    client: Arc<dyn ReleaseClient>,
    cve: Option<Arc<CveClient>>,
    default_limit: usize,
    scrape_wait: Duration,
}

impl GithubCollector {
    /// Creates a collector for `projects`.
    ///
    /// `default_limit` applies to projects without their own `limit`.
    /// `scrape_wait` is slept between two projects, never after the last
    /// one; `Duration::ZERO` disables the pause.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use apprelease_exporter::collector::GithubCollector;
    /// use apprelease_exporter::github::{HttpGithubClient, DEFAULT_API_URL};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// # fn main() -> apprelease_exporter::Result<()> {
    /// let client = Arc::new(HttpGithubClient::new(DEFAULT_API_URL, None)?);
    /// let _collector = GithubCollector::new(Vec::new(), client, None, 25, Duration::from_secs(2));
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        projects: Vec<GithubProject>,
        client: Arc<dyn ReleaseClient>,
        cve: Option<Arc<CveClient>>,
        default_limit: usize,
        scrape_wait: Duration,
    ) -> Self {
        Self {
            projects,
            client,
            cve,
            default_limit,
            scrape_wait,
        }
    }

    async fn collect_project(
        &self,
        project: &GithubProject,
        cancel: &CancellationToken,
        releases: &mut MetricList,
        cves: &mut MetricList,
    ) -> Result<()> {
        let name = &project.common.name;
        info!(project = %name, repository = %project.project, fetch_type = ?project.fetch_type, "starting collection");

        let versions = match project.fetch_type {
            FetchType::Releases => self.fetch_releases(project, cancel).await?,
            FetchType::Tags => self.fetch_tags(project, cancel).await?,
        };

        let report = if versions.is_empty() {
            None
        } else {
            project_cve_report(self.cve.as_deref(), &project.common, cancel).await?
        };

        for release in &versions {
            let labels = [
                ("name", name.clone()),
                ("project", project.project.clone()),
                ("tag", release.tag.clone()),
                ("version", release.version.clone()),
                (
                    "marked",
                    bool_label(project.common.is_marked(&release.version)).to_string(),
                ),
            ];

            match release.created_at {
                Some(created_at) => releases.add_time(labels, created_at),
                None => releases.add_info(labels),
            }

            if let Some(report) = &report {
                for entry in report.by_version(&release.version) {
                    cves.add(
                        cve_labels(name, ("project", &project.project), &release.version, entry),
                        entry.cvss,
                    );
                }
            }
        }

        info!(project = %name, versions = versions.len(), "finished collection");
        Ok(())
    }

    fn split_project<'a>(&self, project: &'a GithubProject) -> Result<(&'a str, &'a str)> {
        project.owner_and_repository().ok_or_else(|| {
            Error::Config(format!("'{}' is not in owner/repository form", project.project))
        })
    }

    async fn fetch_releases(
        &self,
        project: &GithubProject,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredVersion>> {
        let (owner, repo) = self.split_project(project)?;
        let limit = project.limit_or(self.default_limit);

        let releases = cancellable(cancel, self.client.releases(owner, repo, limit)).await?;

        Ok(releases
            .into_iter()
            .filter_map(|release| {
                let version = project.common.filter.accept(&release.tag_name)?;
                debug!(project = %project.common.name, %version, "found release");
                Some(DiscoveredVersion::new(release.tag_name, version).with_created_at(release.created_at))
            })
            .take(limit)
            .collect())
    }

    /// Lists tags and resolves each accepted tag's commit date. A failed
    /// commit lookup fails the whole project.
    async fn fetch_tags(
        &self,
        project: &GithubProject,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredVersion>> {
        let (owner, repo) = self.split_project(project)?;
        let limit = project.limit_or(self.default_limit);

        let tags = cancellable(cancel, self.client.tags(owner, repo, limit)).await?;

        let mut versions = Vec::new();
        for tag in tags.into_iter().take(limit) {
            let Some(version) = project.common.filter.accept(&tag.name) else {
                continue;
            };

            let created_at =
                cancellable(cancel, self.client.commit_date(owner, repo, &tag.commit_sha)).await?;
            debug!(project = %project.common.name, %version, %created_at, "found tag");
            versions.push(DiscoveredVersion::new(tag.name, version).with_created_at(Some(created_at)));
        }

        Ok(versions)
    }
}

#[async_trait]
impl Collector for GithubCollector {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<MetricFamily>> {
        let mut releases = MetricList::new();
        let mut cves = MetricList::new();

        for (i, project) in self.projects.iter().enumerate() {
            if i > 0 && !self.scrape_wait.is_zero() {
                cancellable(cancel, async {
                    tokio::time::sleep(self.scrape_wait).await;
                    Ok(())
                })
                .await?;
            }

            // Points of a failed project are discarded, not half-published.
            let mut project_releases = MetricList::new();
            let mut project_cves = MetricList::new();
            match self
                .collect_project(project, cancel, &mut project_releases, &mut project_cves)
                .await
            {
                Ok(()) => {
                    releases.extend(project_releases);
                    cves.extend(project_cves);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!(project = %project.common.name, error = %e, "collection failed");
                }
            }
        }

        Ok(vec![
            MetricFamily::new(families::GITHUB_RELEASE, families::GITHUB_RELEASE_HELP, releases),
            MetricFamily::new(
                families::GITHUB_RELEASE_CVE,
                families::GITHUB_RELEASE_CVE_HELP,
                cves,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::config::Config;
    use crate::github::{GithubRelease, GithubTag};

    #[derive(Default)]
    struct FakeGithub {
        releases: HashMap<String, Vec<GithubRelease>>,
        tags: HashMap<String, Vec<GithubTag>>,
        commits: HashMap<String, DateTime<Utc>>,
        requested_limits: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ReleaseClient for FakeGithub {
        async fn releases(&self, owner: &str, repo: &str, per_page: usize) -> Result<Vec<GithubRelease>> {
            self.requested_limits.lock().unwrap().push(per_page);
            self.releases
                .get(&format!("{owner}/{repo}"))
                .cloned()
                .ok_or_else(|| Error::Upstream(format!("{owner}/{repo} not found")))
        }

        async fn tags(&self, owner: &str, repo: &str, per_page: usize) -> Result<Vec<GithubTag>> {
            self.requested_limits.lock().unwrap().push(per_page);
            self.tags
                .get(&format!("{owner}/{repo}"))
                .cloned()
                .ok_or_else(|| Error::Upstream(format!("{owner}/{repo} not found")))
        }

        async fn commit_date(&self, _owner: &str, _repo: &str, sha: &str) -> Result<DateTime<Utc>> {
            self.commits
                .get(sha)
                .copied()
                .ok_or_else(|| Error::Upstream(format!("commit {sha} not found")))
        }
    }

    fn release(tag: &str, created_at: Option<DateTime<Utc>>) -> GithubRelease {
        GithubRelease {
            tag_name: tag.to_string(),
            created_at,
        }
    }

    fn tag(name: &str, sha: &str) -> GithubTag {
        GithubTag {
            name: name.to_string(),
            commit_sha: sha.to_string(),
        }
    }

    fn projects(yaml: &str) -> Vec<GithubProject> {
        Config::from_yaml(yaml).unwrap().projects.github
    }

    fn collector(projects: Vec<GithubProject>, client: FakeGithub) -> GithubCollector {
        GithubCollector::new(projects, Arc::new(client), None, 25, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_releases_mode() {
        let created = Utc.with_ymd_and_hms(2024, 2, 22, 12, 0, 0).unwrap();
        let mut client = FakeGithub::default();
        client.releases.insert(
            "prometheus/prometheus".into(),
            vec![
                release("v2.50.0", Some(created)),
                release("v2.50.0-rc.0", Some(created)),
                release("v2.49.1", None),
            ],
        );

        let collector = collector(
            projects(
                r#"
projects:
  github:
    - name: prometheus
      project: prometheus/prometheus
      limit: 10
      mark: ["2.49.1"]
      filter:
        blacklist: 'rc'
        replacement:
          - match: '^v'
            replace: ''
"#,
            ),
            client,
        );

        let families = collector.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(families[0].name, families::GITHUB_RELEASE);

        let points = &families[0].points;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label("project"), Some("prometheus/prometheus"));
        assert_eq!(points[0].label("tag"), Some("v2.50.0"));
        assert_eq!(points[0].label("version"), Some("2.50.0"));
        assert_eq!(points[0].label("marked"), Some("false"));
        assert_eq!(points[0].value, created.timestamp() as f64);

        assert_eq!(points[1].label("version"), Some("2.49.1"));
        assert_eq!(points[1].label("marked"), Some("true"));
        assert_eq!(points[1].value, 1.0);
    }

    #[tokio::test]
    async fn test_tags_mode_uses_commit_date() {
        let created = Utc.with_ymd_and_hms(2023, 5, 1, 8, 30, 0).unwrap();
        let mut client = FakeGithub::default();
        client
            .tags
            .insert("o/r".into(), vec![tag("1.1", "bbb"), tag("nightly", "ccc"), tag("1.0", "aaa")]);
        client.commits.insert("aaa".into(), created);
        client.commits.insert("bbb".into(), created);

        let collector = collector(
            projects(
                r#"
projects:
  github:
    - name: lib
      project: o/r
      fetchType: tags
      filter:
        whitelist: '^\d'
"#,
            ),
            client,
        );

        let families = collector.collect(&CancellationToken::new()).await.unwrap();
        let versions: Vec<_> = families[0]
            .points
            .iter()
            .map(|p| p.label("version").unwrap())
            .collect();

        // "nightly" is filtered before its commit is looked up
        assert_eq!(versions, vec!["1.1", "1.0"]);
        assert!(families[0].points.iter().all(|p| p.value == created.timestamp() as f64));
    }

    #[tokio::test]
    async fn test_failed_commit_lookup_drops_project() {
        let mut client = FakeGithub::default();
        client.tags.insert("o/broken".into(), vec![tag("1.0", "missing")]);
        client.releases.insert("o/ok".into(), vec![release("1.0", None)]);

        let collector = collector(
            projects(
                r#"
projects:
  github:
    - name: broken
      project: o/broken
      fetchType: tags
    - name: ok
      project: o/ok
"#,
            ),
            client,
        );

        let families = collector.collect(&CancellationToken::new()).await.unwrap();

        assert_eq!(families[0].points.len(), 1);
        assert_eq!(families[0].points[0].label("name"), Some("ok"));
    }

    #[tokio::test]
    async fn test_limit_is_passed_upstream() {
        let mut client = FakeGithub::default();
        client.releases.insert("o/a".into(), Vec::new());
        client.releases.insert("o/b".into(), Vec::new());
        let client = Arc::new(client);

        let collector = GithubCollector::new(
            projects(
                r#"
projects:
  github:
    - name: a
      project: o/a
      limit: 3
    - name: b
      project: o/b
"#,
            ),
            client.clone(),
            None,
            25,
            Duration::ZERO,
        );

        collector.collect(&CancellationToken::new()).await.unwrap();

        assert_eq!(*client.requested_limits.lock().unwrap(), vec![3, 25]);
    }

    #[tokio::test]
    async fn test_cancel_during_scrape_wait() {
        let mut client = FakeGithub::default();
        client.releases.insert("o/a".into(), Vec::new());
        client.releases.insert("o/b".into(), Vec::new());

        let collector = GithubCollector::new(
            projects(
                r#"
projects:
  github:
    - name: a
      project: o/a
    - name: b
      project: o/b
"#,
            ),
            Arc::new(client),
            None,
            25,
            Duration::from_secs(3600),
        );

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        assert!(matches!(collector.collect(&cancel).await, Err(Error::Cancelled)));
    }
}
