use metrics::Label;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use super::MetricFamily;

/// In-process table of the current metric values.
///
/// [`publish`](Self::publish) replaces every family it is given and
/// re-encodes the exposition text under a single write lock, and
/// [`render`](Self::render) reads under a single read lock. A scrape
/// therefore sees either all families of a collection cycle or none of
/// them, never a mix of two cycles.
///
/// # Example
///
/// ```
/// use apprelease_exporter::metrics::{MetricFamily, MetricList, MetricsStore};
///
/// let store = MetricsStore::new();
/// let mut list = MetricList::new();
/// list.add_info([("name", "nginx")]);
/// store.publish(vec![MetricFamily::new("apprelease_example", "Example", list)]);
///
/// assert!(store.render().contains("apprelease_example{name=\"nginx\"}"));
/// ```
#[derive(Debug, Default)]
pub struct MetricsStore {
    snapshot: RwLock<Snapshot>,
}

#[derive(Debug, Default)]
struct Snapshot {
    families: BTreeMap<&'static str, MetricFamily>,
    exposition: String,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the named families with the given tables.
    ///
    /// Families not mentioned are left untouched. A family published with
    /// no points is emptied.
    pub fn publish(&self, families: Vec<MetricFamily>) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for family in families {
            snapshot.families.insert(family.name, family);
        }
        snapshot.exposition = encode(&snapshot.families);
    }

    /// Returns a copy of the named family, if it was ever published.
    pub fn family(&self, name: &str) -> Option<MetricFamily> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .families
            .get(name)
            .cloned()
    }

    /// Current contents in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exposition
            .clone()
    }
}

/// Encodes `families` with a throwaway Prometheus recorder, so label sets
/// dropped since the previous cycle disappear from the output.
fn encode(families: &BTreeMap<&'static str, MetricFamily>) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        for family in families.values() {
            metrics::describe_gauge!(family.name, family.help);
            for point in &family.points {
                let labels: Vec<Label> = point
                    .labels
                    .iter()
                    .map(|(key, value)| Label::new(key.clone(), value.clone()))
                    .collect();
                metrics::gauge!(family.name, labels).set(point.value);
            }
        }
    });

    handle.render()
}
