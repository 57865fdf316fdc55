//! Project configuration file handling.
//!
//! The project file lists the Docker images and GitHub repositories to watch.
//! It is read once at startup and is immutable afterwards. Both YAML
//! (`.yaml`/`.yml`) and TOML are accepted. `${VAR}` references are expanded
//! from the environment before parsing.
//!
//! # Example Configuration
//!
//! ```yaml
//! projects:
//!   docker:
//!     - name: nginx
//!       image: library/nginx
//!       limit: 10
//!       filter:
//!         whitelist: '^\d+\.\d+\.\d+$'
//!       mark: ["1.25.3"]
//!       cve:
//!         vendor: nginx
//!         product: nginx
//!   github:
//!     - name: prometheus
//!       project: prometheus/prometheus
//!       fetchType: releases
//!       filter:
//!         replacement:
//!           - match: '^v'
//!             replace: ''
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::VersionFilter;

/// Registry used when a Docker project does not configure one.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io/";

/// Parsed project configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub projects: Projects,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Projects {
    pub docker: Vec<DockerProject>,
    pub github: Vec<GithubProject>,
}

/// Settings shared by every project kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCommon {
    pub name: String,

    #[serde(default)]
    pub filter: VersionFilter,

    /// Versions that get `marked="true"` (e.g. deployed or approved).
    #[serde(default)]
    pub mark: Vec<String>,

    #[serde(default)]
    pub cve: Option<CveTarget>,
}

impl ProjectCommon {
    /// Case-insensitive exact match against the mark list.
    pub fn is_marked(&self, version: &str) -> bool {
        let version = version.to_lowercase();
        self.mark.iter().any(|mark| mark.to_lowercase() == version)
    }

    /// The CVE vendor/product pair, if both halves are set.
    pub fn cve_target(&self) -> Option<&CveTarget> {
        self.cve
            .as_ref()
            .filter(|cve| !cve.vendor.is_empty() && !cve.product.is_empty())
    }
}

/// Vendor/product pair used to query the CVE search service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CveTarget {
    pub vendor: String,
    pub product: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerProject {
    #[serde(flatten)]
    pub common: ProjectCommon,

    pub image: String,

    #[serde(default)]
    pub registry: RegistryConfig,

    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: Option<String>,
    pub username: String,
    pub password: String,
}

/// Resolved registry endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl DockerProject {
    /// Registry URL and credentials, falling back to anonymous Docker Hub.
    pub fn registry(&self) -> RegistryCredentials {
        match self.registry.url.as_deref() {
            Some(url) if !url.is_empty() => RegistryCredentials {
                url: url.to_string(),
                username: self.registry.username.clone(),
                password: self.registry.password.clone(),
            },
            _ => RegistryCredentials {
                url: DEFAULT_REGISTRY_URL.to_string(),
                username: String::new(),
                password: String::new(),
            },
        }
    }

    pub fn limit_or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default)
    }
}

/// How GitHub versions are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchType {
    #[default]
    Releases,
    #[serde(alias = "tag")]
    Tags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubProject {
    #[serde(flatten)]
    pub common: ProjectCommon,

    /// Repository in `owner/repo` form.
    pub project: String,

    #[serde(default, rename = "fetchType", alias = "fetch_type")]
    pub fetch_type: FetchType,

    pub limit: Option<usize>,
}

impl GithubProject {
    pub fn owner_and_repository(&self) -> Option<(&str, &str)> {
        self.project
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
    }

    pub fn limit_or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default)
    }
}

impl Config {
    /// Reads, expands and parses the project file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, references an unset
    /// environment variable, fails to parse, contains an invalid regular
    /// expression, or defines an invalid project.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let content = expand_env(&raw, |name| std::env::var(name).ok())?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content)?,
            _ => Self::from_toml(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Checks project definitions that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for project in &self.projects.docker {
            if project.common.name.trim().is_empty() {
                return Err(Error::Config(format!(
                    "docker project for image '{}' has no name",
                    project.image
                )));
            }
            if project.image.trim().is_empty() {
                return Err(Error::Config(format!(
                    "docker project '{}' has no image",
                    project.common.name
                )));
            }
        }

        for project in &self.projects.github {
            if project.common.name.trim().is_empty() {
                return Err(Error::Config(format!(
                    "github project '{}' has no name",
                    project.project
                )));
            }
            if project.owner_and_repository().is_none() {
                return Err(Error::Config(format!(
                    "github project '{}': '{}' is not in owner/repository form",
                    project.common.name, project.project
                )));
            }
        }

        Ok(())
    }
}

/// Parses a duration such as `12h`, `1h30m`, `2s`, `500ms` or `0`.
///
/// Negative durations are accepted and clamp to zero, which disables
/// whatever interval they configure.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::Config(format!("invalid duration '{}'", input));

    let trimmed = input.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total += number * seconds;
    }

    if negative {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

/// Substitutes `${NAME}` references using `lookup`. `$` not followed by `{`
/// is kept verbatim so regex anchors in filters survive.
fn expand_env(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::Config("unterminated ${ in configuration".to_string()))?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| {
            Error::Config(format!("environment variable '{}' is not set", name))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
