//! Release collectors.
//!
//! This module provides the [`Collector`] trait and one implementation per
//! source type. A collector turns its configured projects into complete
//! metric tables; it never touches the [`MetricsStore`](crate::metrics::MetricsStore)
//! itself, the scheduler publishes what it returns.
//!
//! # Available Collectors
//!
//! | Collector | Source | Metrics |
//! |-----------|--------|---------|
//! | [`DockerCollector`] | Docker Registry v2 tags | `apprelease_project_docker_release{,_cve}` |
//! | [`GithubCollector`] | GitHub releases or tags | `apprelease_project_github_release{,_cve}` |
//! | [`StatsCollector`] | scheduler timings | `apprelease_stats` |

mod docker;
mod github;
mod stats;

pub use docker::DockerCollector;
pub use github::GithubCollector;
pub use stats::StatsCollector;

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ProjectCommon;
use crate::cve::{CveClient, CveReport};
use crate::error::{Error, Result};
use crate::metrics::MetricFamily;

/// Produces the metric tables of one source type.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Short name used in logs and in `apprelease_stats{name}`.
    fn name(&self) -> &'static str;

    /// Runs one full collection.
    ///
    /// Failures of individual projects are logged and leave those projects
    /// out of the result. An error is returned only when the collection as a
    /// whole cannot complete, e.g. on cancellation.
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<MetricFamily>>;
}

/// Runs `fut` unless `cancel` fires first.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Fetches the CVE report of `project` if CVE correlation is configured.
///
/// Errors are logged and yield `None` so the project is still collected
/// without CVE labels. Only cancellation is propagated.
pub(crate) async fn project_cve_report(
    cve: Option<&CveClient>,
    project: &ProjectCommon,
    cancel: &CancellationToken,
) -> Result<Option<CveReport>> {
    let (Some(client), Some(target)) = (cve, project.cve_target()) else {
        return Ok(None);
    };

    info!(project = %project.name, "fetching cve report");
    match cancellable(cancel, client.fetch_report(target)).await {
        Ok(report) => Ok(report),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            error!(project = %project.name, error = %e, "cve report unavailable");
            Ok(None)
        }
    }
}
