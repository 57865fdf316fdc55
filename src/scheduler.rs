//! Periodic execution of collectors.
//!
//! Each enabled collector gets its own [`CollectorScheduler`] running on its
//! own task. A cycle collects, publishes the complete result to the
//! [`MetricsStore`] and records how long it took, then sleeps for the
//! configured interval. Collection failures never stop the loop.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::collector::Collector;
use crate::error::{Error, Result};
use crate::metrics::MetricsStore;

/// Duration of the most recent cycle per collector name.
#[derive(Debug, Clone, Default)]
pub struct ScrapeStats {
    durations: Arc<RwLock<BTreeMap<String, Duration>>>,
}

impl ScrapeStats {
    /// Stores `duration` as the latest cycle time of `name`.
    pub fn record(&self, name: &str, duration: Duration) {
        self.durations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), duration);
    }

    /// Copy of all recorded durations, ordered by collector name.
    pub fn snapshot(&self) -> Vec<(String, Duration)> {
        self.durations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, duration)| (name.clone(), *duration))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Collecting,
    Publishing,
    Sleeping,
}

/// Drives one collector on a fixed interval.
pub struct CollectorScheduler {
    collector: Arc<dyn Collector>,
    interval: Duration,
    hidden: bool,
    store: Arc<MetricsStore>,
    stats: ScrapeStats,
    state: RwLock<SchedulerState>,
}

macro_rules! cycle_log {
    ($hidden:expr, $($arg:tt)+) => {
        if $hidden {
            debug!($($arg)+);
        } else {
            info!($($arg)+);
        }
    };
}

impl CollectorScheduler {
    /// Creates a scheduler, or `None` when `interval` is zero, which
    /// disables the collector.
    pub fn new(
        collector: Arc<dyn Collector>,
        interval: Duration,
        store: Arc<MetricsStore>,
        stats: ScrapeStats,
    ) -> Option<Self> {
        if interval.is_zero() {
            return None;
        }

        Some(Self {
            collector,
            interval,
            hidden: false,
            store,
            stats,
            state: RwLock::new(SchedulerState::Idle),
        })
    }

    /// Marks the scheduler as internal. Its cycles are logged at debug level
    /// and its durations are not recorded in [`ScrapeStats`].
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.collector.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Runs one collect/publish cycle.
    ///
    /// A failed collection leaves the previously published metrics in place.
    /// Only cancellation is returned as an error.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.name();
        cycle_log!(self.hidden, collector = name, "starting metrics collection");

        self.set_state(SchedulerState::Collecting);
        let started = Instant::now();
        let result = self.collector.collect(cancel).await;

        match result {
            Ok(families) => {
                self.set_state(SchedulerState::Publishing);
                self.store.publish(families);
            }
            Err(Error::Cancelled) => {
                self.set_state(SchedulerState::Idle);
                return Err(Error::Cancelled);
            }
            Err(e) => {
                error!(collector = name, error = %e, "metrics collection failed");
            }
        }

        let elapsed = started.elapsed();
        // internal schedulers are not reported in apprelease_stats
        if !self.hidden {
            self.stats.record(name, elapsed);
        }
        self.set_state(SchedulerState::Idle);
        cycle_log!(
            self.hidden,
            collector = name,
            duration = ?elapsed,
            next_run = ?self.interval,
            "finished metrics collection"
        );

        Ok(())
    }

    /// Runs cycles until `cancel` fires. The first cycle starts immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        cycle_log!(self.hidden, collector = self.name(), interval = ?self.interval, "scheduler started");

        loop {
            if self.run_cycle(&cancel).await.is_err() {
                break;
            }

            self.set_state(SchedulerState::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.set_state(SchedulerState::Idle);
        info!(collector = self.name(), "scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::metrics::{MetricFamily, MetricList};

    struct CountingCollector {
        runs: AtomicUsize,
        fail_after: usize,
    }

    impl CountingCollector {
        fn new(fail_after: usize) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                fail_after,
            })
        }
    }

    #[async_trait]
    impl Collector for CountingCollector {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn collect(&self, _cancel: &CancellationToken) -> Result<Vec<MetricFamily>> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run > self.fail_after {
                return Err(Error::Upstream("source unavailable".into()));
            }

            let mut list = MetricList::new();
            list.add([("run", run.to_string())], run as f64);
            Ok(vec![MetricFamily::new("test_metric", "test", list)])
        }
    }

    #[test]
    fn test_zero_interval_disables() {
        let scheduler = CollectorScheduler::new(
            CountingCollector::new(1),
            Duration::ZERO,
            Arc::new(MetricsStore::default()),
            ScrapeStats::default(),
        );

        assert!(scheduler.is_none());
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_metrics() {
        let store = Arc::new(MetricsStore::default());
        let stats = ScrapeStats::default();
        let collector = CountingCollector::new(1);
        let scheduler = CollectorScheduler::new(
            collector.clone(),
            Duration::from_secs(60),
            store.clone(),
            stats.clone(),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        scheduler.run_cycle(&cancel).await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.run_cycle(&cancel).await.unwrap();

        let family = store.family("test_metric").unwrap();
        assert_eq!(family.points.len(), 1);
        assert_eq!(family.points[0].label("run"), Some("1"));

        let recorded = stats.snapshot();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "counting");
        assert_eq!(collector.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MetricsStore::default());
        let collector = CountingCollector::new(usize::MAX);
        let scheduler = Arc::new(
            CollectorScheduler::new(
                collector.clone(),
                Duration::from_secs(3600),
                store.clone(),
                ScrapeStats::default(),
            )
            .unwrap()
            .hidden(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        while collector.runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(collector.runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(store.family("test_metric").is_some());
    }

    #[test]
    fn test_stats_keep_latest_duration() {
        let stats = ScrapeStats::default();
        stats.record("docker", Duration::from_secs(1));
        stats.record("docker", Duration::from_secs(3));
        stats.record("collector", Duration::from_millis(1));

        assert_eq!(
            stats.snapshot(),
            vec![
                ("collector".to_string(), Duration::from_millis(1)),
                ("docker".to_string(), Duration::from_secs(3)),
            ]
        );
    }

    #[tokio::test]
    async fn test_hidden_scheduler_does_not_report_itself() {
        use crate::collector::StatsCollector;
        use crate::metrics::families;

        let store = Arc::new(MetricsStore::default());
        let stats = ScrapeStats::default();
        let scheduler = CollectorScheduler::new(
            Arc::new(StatsCollector::new(stats.clone())),
            Duration::from_secs(10),
            store.clone(),
            stats.clone(),
        )
        .unwrap()
        .hidden();
        let cancel = CancellationToken::new();

        scheduler.run_cycle(&cancel).await.unwrap();
        scheduler.run_cycle(&cancel).await.unwrap();

        assert!(stats.snapshot().is_empty());
        assert!(store.family(families::STATS).unwrap().points.is_empty());
    }
}
