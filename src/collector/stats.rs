use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::Collector;
use crate::error::Result;
use crate::metrics::families;
use crate::metrics::{MetricFamily, MetricList};
use crate::scheduler::ScrapeStats;

/// Exposes how long the last run of every collector took.
pub struct StatsCollector {
    stats: ScrapeStats,
}

impl StatsCollector {
    /// Reports the durations recorded in `stats` by the other schedulers.
    pub fn new(stats: ScrapeStats) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Collector for StatsCollector {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn collect(&self, _cancel: &CancellationToken) -> Result<Vec<MetricFamily>> {
        let mut list = MetricList::new();
        for (name, duration) in self.stats.snapshot() {
            list.add_duration([("name", name), ("type", "collectorDuration".to_string())], duration);
        }

        Ok(vec![MetricFamily::new(families::STATS, families::STATS_HELP, list)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reports_recorded_durations() {
        let stats = ScrapeStats::default();
        stats.record("docker", Duration::from_millis(2500));
        stats.record("github", Duration::from_secs(4));

        let families = StatsCollector::new(stats.clone())
            .collect(&CancellationToken::new())
            .await
            .unwrap();

        let points = &families[0].points;
        assert_eq!(families[0].name, families::STATS);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label("name"), Some("docker"));
        assert_eq!(points[0].label("type"), Some("collectorDuration"));
        assert_eq!(points[0].value, 2.5);
        assert_eq!(points[1].value, 4.0);
    }
}
