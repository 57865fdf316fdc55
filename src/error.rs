//! Error types shared by the collection engine.

use std::path::PathBuf;

/// Errors raised while loading configuration or collecting releases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid regular expression '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("unexpected upstream response: {0}")]
    Upstream(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True for failures of the remote side (transport errors and non-success
    /// statuses) as opposed to local or decoding problems.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Status { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
