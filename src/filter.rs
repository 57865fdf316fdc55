//! Per-project version filtering and normalization.
//!
//! Every raw tag or release name goes through a [`VersionFilter`] before any
//! further network work is done for it. The filter applies, in this order:
//!
//! 1. each replacement rule, feeding the output of one rule into the next
//! 2. the whitelist (substring match, the version must match)
//! 3. the blacklist (substring match, a match always invalidates)
//!
//! Patterns are compiled once when the configuration is deserialized, so an
//! invalid expression is reported at startup.
//!
//! # Example
//!
//! ```
//! use apprelease_exporter::filter::{FilterConfig, ReplacementConfig, VersionFilter};
//!
//! let filter = VersionFilter::try_from(FilterConfig {
//!     whitelist: Some(r"^\d+\.\d+$".into()),
//!     blacklist: Some(r"^0\.".into()),
//!     replacement: vec![ReplacementConfig {
//!         pattern: r"^v(\d+)".into(),
//!         replace: "$1".into(),
//!     }],
//! })
//! .unwrap();
//!
//! assert_eq!(filter.normalize("v2.1"), ("2.1".to_string(), true));
//! assert_eq!(filter.normalize("v0.9"), ("0.9".to_string(), false));
//! ```

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Filter section as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub whitelist: Option<String>,
    pub blacklist: Option<String>,
    pub replacement: Vec<ReplacementConfig>,
}

/// A single `match -> replace` rewrite rule.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplacementConfig {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub replace: String,
}

#[derive(Debug, Clone)]
struct Replacement {
    pattern: Regex,
    replace: String,
}

impl Replacement {
    fn apply(&self, value: &str) -> String {
        self.pattern
            .replace_all(value, self.replace.as_str())
            .into_owned()
    }
}

/// Compiled whitelist/blacklist/replacement rules of one project.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "FilterConfig")]
pub struct VersionFilter {
    whitelist: Option<Regex>,
    blacklist: Option<Regex>,
    replacements: Vec<Replacement>,
}

impl TryFrom<FilterConfig> for VersionFilter {
    type Error = Error;

    fn try_from(config: FilterConfig) -> Result<Self> {
        let replacements = config
            .replacement
            .into_iter()
            .map(|rule| {
                Ok(Replacement {
                    pattern: compile(&rule.pattern)?,
                    replace: rule.replace,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            whitelist: compile_optional(config.whitelist.as_deref())?,
            blacklist: compile_optional(config.blacklist.as_deref())?,
            replacements,
        })
    }
}

impl VersionFilter {
    /// Rewrites `raw` and decides whether the result is a valid version.
    ///
    /// The blacklist has the final word: a version matching it is invalid
    /// even when the whitelist matched.
    pub fn normalize(&self, raw: &str) -> (String, bool) {
        let version = self
            .replacements
            .iter()
            .fold(raw.to_string(), |value, rule| rule.apply(&value));

        let mut valid = true;

        if let Some(whitelist) = &self.whitelist {
            valid = whitelist.is_match(&version);
        }

        if let Some(blacklist) = &self.blacklist {
            if blacklist.is_match(&version) {
                valid = false;
            }
        }

        (version, valid)
    }

    /// Returns the normalized version if `raw` passes the filter.
    pub fn accept(&self, raw: &str) -> Option<String> {
        match self.normalize(raw) {
            (version, true) => Some(version),
            _ => None,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| Error::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_optional(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern.map(str::trim) {
        Some(pattern) if !pattern.is_empty() => compile(pattern).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(whitelist: Option<&str>, blacklist: Option<&str>, rules: &[(&str, &str)]) -> VersionFilter {
        VersionFilter::try_from(FilterConfig {
            whitelist: whitelist.map(String::from),
            blacklist: blacklist.map(String::from),
            replacement: rules
                .iter()
                .map(|(pattern, replace)| ReplacementConfig {
                    pattern: pattern.to_string(),
                    replace: replace.to_string(),
                })
                .collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_filter_order_replacement_then_lists() {
        let f = filter(Some(r"^\d+\.\d+$"), Some(r"^0\."), &[(r"v(\d+)", "$1")]);

        assert_eq!(f.normalize("v0.9"), ("0.9".to_string(), false));
        assert_eq!(f.normalize("v2.1"), ("2.1".to_string(), true));
    }

    #[test]
    fn test_blacklist_vetoes_whitelist() {
        let f = filter(Some(r"\d"), Some(r"rc"), &[]);

        for input in ["1.0-rc1", "rc2", "2.0rc"] {
            let (_, valid) = f.normalize(input);
            assert!(!valid, "{input} should be rejected");
        }
        assert!(f.normalize("1.0").1);
    }

    #[test]
    fn test_whitelist_is_substring_match() {
        let f = filter(Some(r"\d+\.\d+"), None, &[]);

        assert!(f.normalize("release-1.2-final").1);
        assert!(!f.normalize("latest").1);
    }

    #[test]
    fn test_replacements_are_chained_in_order() {
        let f = filter(None, None, &[("^release-", ""), ("_", "."), (r"^(\d+)\.(\d+)$", "$1.$2.0")]);

        assert_eq!(f.normalize("release-1_4"), ("1.4.0".to_string(), true));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let f = VersionFilter::default();

        assert_eq!(f.accept("anything"), Some("anything".to_string()));
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let f = filter(Some("   "), Some(""), &[]);

        assert!(f.normalize("latest").1);
    }

    #[test]
    fn test_patterns_are_trimmed() {
        let f = filter(Some("  ^1\\.  \n"), None, &[]);

        assert!(f.normalize("1.2").1);
        assert!(!f.normalize("2.1").1);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = VersionFilter::try_from(FilterConfig {
            whitelist: Some("(".into()),
            ..FilterConfig::default()
        })
        .unwrap_err();

        assert!(matches!(err, Error::Regex { .. }));
    }

    #[test]
    fn test_deserialize_compiles_patterns() {
        let f: VersionFilter = serde_json::from_value(serde_json::json!({
            "whitelist": "^v",
            "replacement": [{"match": "^v", "replace": ""}]
        }))
        .unwrap();

        assert_eq!(f.accept("v1.0"), None);
        assert_eq!(f.normalize("v1.0"), ("1.0".to_string(), false));
    }
}
