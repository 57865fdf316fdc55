//! Names, help texts and label sets of every exported metric.

use crate::cve::CveEntry;

pub const DOCKER_RELEASE: &str = "apprelease_project_docker_release";
pub const DOCKER_RELEASE_HELP: &str = "AppRelease project docker information";

pub const DOCKER_RELEASE_CVE: &str = "apprelease_project_docker_release_cve";
pub const DOCKER_RELEASE_CVE_HELP: &str = "AppRelease project docker cve reports";

pub const GITHUB_RELEASE: &str = "apprelease_project_github_release";
pub const GITHUB_RELEASE_HELP: &str = "AppRelease project github release information";

pub const GITHUB_RELEASE_CVE: &str = "apprelease_project_github_release_cve";
pub const GITHUB_RELEASE_CVE_HELP: &str = "AppRelease project github release cve reports";

pub const STATS: &str = "apprelease_stats";
pub const STATS_HELP: &str = "AppRelease exporter statistics";

/// Labels of a `*_release_cve` point.
///
/// `source` is the project-identifying label (`image` for Docker, `project`
/// for GitHub).
pub fn cve_labels(
    name: &str,
    source: (&'static str, &str),
    version: &str,
    entry: &CveEntry,
) -> Vec<(&'static str, String)> {
    vec![
        ("name", name.to_string()),
        (source.0, source.1.to_string()),
        ("version", version.to_string()),
        ("cve", entry.id.clone()),
        ("cwe", entry.cwe.clone()),
        ("vector", entry.vector.clone()),
        ("accessAuthentication", entry.access.authentication.clone()),
        ("accessComplexity", entry.access.complexity.clone()),
        ("accessVector", entry.access.vector.clone()),
        ("impactAvailability", entry.impact.availability.clone()),
        ("impactConfidentiality", entry.impact.confidentiality.clone()),
        ("impactIntegrity", entry.impact.integrity.clone()),
    ]
}
