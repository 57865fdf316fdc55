use chrono::{DateTime, Utc};

/// A version discovered during one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredVersion {
    /// Tag or release name as published upstream.
    pub tag: String,
    /// Tag after the project's replacement rules.
    pub version: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl DiscoveredVersion {
    pub fn new(tag: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            version: version.into(),
            created_at: None,
        }
    }

    pub fn with_created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }
}
