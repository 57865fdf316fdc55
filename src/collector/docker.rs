use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{cancellable, project_cve_report, Collector};
use crate::config::{DockerProject, RegistryCredentials};
use crate::cve::CveClient;
use crate::error::{Error, Result};
use crate::metrics::families::{self, cve_labels};
use crate::metrics::{bool_label, MetricFamily, MetricList};
use crate::model::DiscoveredVersion;
use crate::natsort::latest_first;
use crate::registry::{HttpRegistryClient, RegistryClient};

/// Collects image tags from Docker registries.
///
/// All projects are collected concurrently; the collection finishes once
/// every project has either produced its points or failed.
pub struct DockerCollector {
    projects: Vec<DockerProject>,
    clients: HashMap<RegistryCredentials, Arc<dyn RegistryClient>>,
    cve: Option<Arc<CveClient>>,
    default_limit: usize,
}

#[derive(Default)]
struct ProjectMetrics {
    releases: MetricList,
    cves: MetricList,
}

impl DockerCollector {
    /// Creates a collector with one HTTP client per distinct registry.
    ///
    /// `default_limit` applies to projects without their own `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(
        projects: Vec<DockerProject>,
        cve: Option<Arc<CveClient>>,
        default_limit: usize,
    ) -> Result<Self> {
        let mut clients: HashMap<RegistryCredentials, Arc<dyn RegistryClient>> = HashMap::new();
        for project in &projects {
            let credentials = project.registry();
            if !clients.contains_key(&credentials) {
                let client = HttpRegistryClient::new(&credentials)?;
                clients.insert(credentials, Arc::new(client));
            }
        }

        Ok(Self::with_clients(projects, clients, cve, default_limit))
    }

    /// Creates a collector with caller-provided registry clients, keyed by
    /// the credentials each project resolves to.
    pub fn with_clients(
        projects: Vec<DockerProject>,
        clients: HashMap<RegistryCredentials, Arc<dyn RegistryClient>>,
        cve: Option<Arc<CveClient>>,
        default_limit: usize,
    ) -> Self {
        Self {
            projects,
            clients,
            cve,
            default_limit,
        }
    }

    async fn collect_project(
        &self,
        project: &DockerProject,
        cancel: &CancellationToken,
    ) -> Result<ProjectMetrics> {
        let name = &project.common.name;
        info!(project = %name, image = %project.image, "starting collection");

        let credentials = project.registry();
        let client = self.clients.get(&credentials).ok_or_else(|| {
            Error::Config(format!("no registry client for {}", credentials.url))
        })?;

        let versions = self.fetch_versions(client.as_ref(), project, cancel).await?;
        let report = if versions.is_empty() {
            None
        } else {
            project_cve_report(self.cve.as_deref(), &project.common, cancel).await?
        };

        let mut metrics = ProjectMetrics::default();
        for release in &versions {
            let labels = [
                ("name", name.clone()),
                ("image", project.image.clone()),
                ("tag", release.tag.clone()),
                ("version", release.version.clone()),
                (
                    "marked",
                    bool_label(project.common.is_marked(&release.version)).to_string(),
                ),
            ];

            match release.created_at {
                Some(created_at) => {
                    debug!(project = %name, version = %release.version, %created_at, "found version");
                    metrics.releases.add_time(labels, created_at);
                }
                None => {
                    debug!(project = %name, version = %release.version, "found version without date");
                    metrics.releases.add_info(labels);
                }
            }

            if let Some(report) = &report {
                let entries = report.by_version(&release.version);
                debug!(project = %name, version = %release.version, count = entries.len(), "cve reports");
                for entry in entries {
                    metrics.cves.add(
                        cve_labels(name, ("image", &project.image), &release.version, entry),
                        entry.cvss,
                    );
                }
            }
        }

        info!(project = %name, versions = versions.len(), "finished collection");
        Ok(metrics)
    }

    /// Lists, filters, orders and limits the tags of `project`, then resolves
    /// the creation time of each remaining tag.
    async fn fetch_versions(
        &self,
        client: &dyn RegistryClient,
        project: &DockerProject,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredVersion>> {
        let raw_tags = cancellable(cancel, client.tags(&project.image)).await?;

        let valid: Vec<String> = raw_tags
            .into_iter()
            .filter(|tag| project.common.filter.normalize(tag).1)
            .collect();
        let tags = latest_first(valid, project.limit_or(self.default_limit));

        let mut versions = Vec::with_capacity(tags.len());
        for tag in tags {
            let (version, _) = project.common.filter.normalize(&tag);

            let created_at =
                match cancellable(cancel, client.manifest_created(&project.image, &tag)).await {
                    Ok(created_at) => created_at,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(project = %project.common.name, %tag, error = %e, "failed to fetch manifest");
                        None
                    }
                };

            versions.push(DiscoveredVersion::new(tag, version).with_created_at(created_at));
        }

        Ok(versions)
    }
}

#[async_trait]
impl Collector for DockerCollector {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<MetricFamily>> {
        let results = join_all(
            self.projects
                .iter()
                .map(|project| async move { (project, self.collect_project(project, cancel).await) }),
        )
        .await;

        let mut releases = MetricList::new();
        let mut cves = MetricList::new();
        for (project, result) in results {
            match result {
                Ok(metrics) => {
                    releases.extend(metrics.releases);
                    cves.extend(metrics.cves);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!(project = %project.common.name, error = %e, "collection failed");
                }
            }
        }

        Ok(vec![
            MetricFamily::new(families::DOCKER_RELEASE, families::DOCKER_RELEASE_HELP, releases),
            MetricFamily::new(
                families::DOCKER_RELEASE_CVE,
                families::DOCKER_RELEASE_CVE_HELP,
                cves,
            ),
        ])
    }
}
