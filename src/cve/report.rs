use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::config::CveTarget;
use crate::error::Result;

/// Field positions inside a colon-separated CPE identifier
/// (`cpe:2.3:a:vendor:product:version:update:...`).
const CPE_VENDOR: usize = 3;
const CPE_PRODUCT: usize = 4;
const CPE_VERSION: usize = 5;
const CPE_QUALIFIER: usize = 6;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CveAccess {
    pub authentication: String,
    pub complexity: String,
    pub vector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CveImpact {
    pub availability: String,
    pub confidentiality: String,
    pub integrity: String,
}

/// One CVE affecting a specific version.
#[derive(Debug, Clone, PartialEq)]
pub struct CveEntry {
    pub id: String,
    pub cvss: f64,
    pub cwe: String,
    pub vector: String,
    pub access: CveAccess,
    pub impact: CveImpact,
}

#[derive(Deserialize)]
struct RawReport {
    results: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawRecord {
    id: String,
    #[serde(default)]
    cvss: Option<f64>,
    #[serde(default)]
    cwe: Option<String>,
    #[serde(default, rename = "cvss-vector")]
    cvss_vector: Option<String>,
    #[serde(default)]
    access: CveAccess,
    #[serde(default)]
    impact: CveImpact,
    #[serde(default)]
    vulnerable_product: Vec<String>,
    #[serde(default)]
    vulnerable_configuration: Vec<String>,
    #[serde(default)]
    vulnerable_configuration_cpe_2_2: Vec<String>,
}

/// CVE search result for one vendor/product, indexed by lower-cased version.
///
/// Built once per fetch and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct CveReport {
    versions: HashMap<String, BTreeMap<String, CveEntry>>,
}

impl CveReport {
    /// Parses a `{"results": [...]}` payload from the CVE search API.
    ///
    /// Records that fail to decode are logged and skipped. A payload
    /// without a `results` list is an error.
    pub fn parse(target: &CveTarget, payload: &[u8]) -> Result<Self> {
        let raw: RawReport = serde_json::from_slice(payload)?;
        let vendor = target.vendor.to_lowercase();
        let product = target.product.to_lowercase();

        let mut report = Self::default();
        for value in raw.results {
            let record: RawRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        vendor = %target.vendor,
                        product = %target.product,
                        error = %e,
                        "skipping malformed cve record"
                    );
                    continue;
                }
            };

            let identifiers = record
                .vulnerable_product
                .iter()
                .chain(&record.vulnerable_configuration)
                .chain(&record.vulnerable_configuration_cpe_2_2);

            for identifier in identifiers {
                if let Some(version) = matching_version(identifier, &vendor, &product) {
                    report
                        .versions
                        .entry(version)
                        .or_default()
                        .entry(record.id.clone())
                        .or_insert_with(|| CveEntry {
                            id: record.id.clone(),
                            cvss: record.cvss.unwrap_or_default(),
                            cwe: record.cwe.clone().unwrap_or_default(),
                            vector: record.cvss_vector.clone().unwrap_or_default(),
                            access: record.access.clone(),
                            impact: record.impact.clone(),
                        });
                }
            }
        }

        Ok(report)
    }

    /// CVEs recorded for `version` (case-insensitive), ordered by id.
    pub fn by_version(&self, version: &str) -> Vec<&CveEntry> {
        self.versions
            .get(&version.to_lowercase())
            .map(|entries| entries.values().collect())
            .unwrap_or_default()
    }

    /// Number of distinct versions with at least one CVE.
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }
}

/// Extracts the lower-cased version from a CPE identifier if it belongs to
/// `vendor`/`product` (both already lower-cased) and carries no
/// pre-release qualifier.
fn matching_version(identifier: &str, vendor: &str, product: &str) -> Option<String> {
    let fields: Vec<&str> = identifier.split(':').collect();
    if fields.len() <= CPE_VERSION {
        return None;
    }

    if fields[CPE_VENDOR].to_lowercase() != vendor
        || fields[CPE_PRODUCT].to_lowercase() != product
    {
        return None;
    }

    let qualifier = fields.get(CPE_QUALIFIER).copied().unwrap_or("");
    if !matches!(qualifier, "" | "*" | "-") {
        return None;
    }

    Some(fields[CPE_VERSION].to_lowercase())
}
