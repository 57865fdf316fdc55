//! Metric values produced by collectors and the snapshot they are served from.
//!
//! Collectors return whole [`MetricFamily`] tables rather than mutating shared
//! gauges. The scheduler hands those tables to a [`MetricsStore`], which
//! swaps them in together.

pub mod families;
mod store;

pub use store::MetricsStore;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// One labeled sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl MetricPoint {
    /// Value of the label `key`, if the point carries it.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Accumulates points for a single metric during one collection.
#[derive(Debug, Clone, Default)]
pub struct MetricList {
    points: Vec<MetricPoint>,
}

impl MetricList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a point with `labels` and `value`. Label order is kept.
    ///
    /// # Example
    ///
    /// ```
    /// use apprelease_exporter::metrics::MetricList;
    ///
    /// let mut list = MetricList::new();
    /// list.add([("name", "nginx"), ("version", "1.25.3")], 7.5);
    /// assert_eq!(list.len(), 1);
    /// ```
    pub fn add<K, V>(&mut self, labels: impl IntoIterator<Item = (K, V)>, value: f64)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.points.push(MetricPoint {
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            value,
        });
    }

    /// Adds a point whose value is `time` in unix seconds.
    pub fn add_time<K, V>(&mut self, labels: impl IntoIterator<Item = (K, V)>, time: DateTime<Utc>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.add(labels, time.timestamp() as f64);
    }

    /// Adds a presence marker with value `1`.
    pub fn add_info<K, V>(&mut self, labels: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.add(labels, 1.0);
    }

    /// Adds a point whose value is `duration` in seconds.
    pub fn add_duration<K, V>(&mut self, labels: impl IntoIterator<Item = (K, V)>, duration: Duration)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.add(labels, duration.as_secs_f64());
    }

    /// Appends all points of `other`.
    pub fn extend(&mut self, other: MetricList) {
        self.points.extend(other.points);
    }

    /// Number of points added so far.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn into_points(self) -> Vec<MetricPoint> {
        self.points
    }
}

/// Complete contents of one gauge for one collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: &'static str,
    pub help: &'static str,
    pub points: Vec<MetricPoint>,
}

impl MetricFamily {
    /// Builds a family from `list`. Points with identical label sets
    /// collapse into one, the last value winning.
    pub fn new(name: &'static str, help: &'static str, list: MetricList) -> Self {
        let mut points: Vec<MetricPoint> = Vec::with_capacity(list.len());
        let mut index: HashMap<Vec<(String, String)>, usize> = HashMap::new();

        for point in list.into_points() {
            match index.get(&point.labels) {
                Some(&i) => points[i].value = point.value,
                None => {
                    index.insert(point.labels.clone(), points.len());
                    points.push(point);
                }
            }
        }

        Self { name, help, points }
    }
}

/// Formats a boolean the way it appears in label values.
pub fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_metric_list_values() {
        let mut list = MetricList::new();
        list.add([("a", "1")], 2.5);
        list.add_time([("a", "2")], Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        list.add_info([("a", "3")]);
        list.add_duration([("a", "4")], Duration::from_millis(1500));

        let points = list.into_points();
        assert_eq!(points[0].value, 2.5);
        assert_eq!(points[1].value, 1_577_836_800.0);
        assert_eq!(points[2].value, 1.0);
        assert_eq!(points[3].value, 1.5);
        assert_eq!(points[3].label("a"), Some("4"));
        assert_eq!(points[3].label("b"), None);
    }

    #[test]
    fn test_family_collapses_duplicate_label_sets() {
        let mut list = MetricList::new();
        list.add([("version", "1.0")], 1.0);
        list.add([("version", "2.0")], 2.0);
        list.add([("version", "1.0")], 3.0);

        let family = MetricFamily::new("m", "help", list);
        assert_eq!(family.points.len(), 2);
        assert_eq!(family.points[0].value, 3.0);
        assert_eq!(family.points[1].value, 2.0);
    }
}
