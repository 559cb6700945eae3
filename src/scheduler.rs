//! Background Job Scheduler
//!
//! Owns the periodic maintenance loops: baseline rebuilds, feed refreshes,
//! alert retention purges and finding-table pruning. Each job runs on its
//! own tokio interval, logs its own failures and keeps going; a shutdown
//! signal stops all loops.

use crate::baseline::{BaselineStore, Direction, FlowHistory};
use crate::feeds::FeedManager;
use crate::pipeline::DetectionPipeline;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub baseline_rebuild_interval_secs: u64,
    /// History window each rebuild reads, in hours
    pub baseline_lookback_hours: u64,
    /// Hard ceiling on one rebuild pass
    pub baseline_rebuild_timeout_secs: u64,
    pub feed_refresh_interval_secs: u64,
    pub alert_purge_interval_secs: u64,
    pub finding_prune_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            baseline_rebuild_interval_secs: 3_600,
            baseline_lookback_hours: 24 * 7,
            baseline_rebuild_timeout_secs: 300,
            feed_refresh_interval_secs: 3_600,
            alert_purge_interval_secs: 86_400,
            finding_prune_interval_secs: 600,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    pipeline: Arc<DetectionPipeline>,
    baselines: Arc<BaselineStore>,
    history: Arc<dyn FlowHistory>,
    feeds: Arc<FeedManager>,
}

/// Handle over the running jobs; dropping it does not stop them, call
/// [`SchedulerHandle::shutdown`].
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task did not stop cleanly");
            }
        }
        info!("scheduler stopped");
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pipeline: Arc<DetectionPipeline>,
        baselines: Arc<BaselineStore>,
        history: Arc<dyn FlowHistory>,
        feeds: Arc<FeedManager>,
    ) -> Self {
        Self { config, pipeline, baselines, history, feeds }
    }

    /// Spawn every job loop. Each interval ticks immediately once, so the
    /// first rebuild and refresh happen at startup rather than one period in.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            baseline_interval = self.config.baseline_rebuild_interval_secs,
            feed_interval = self.config.feed_refresh_interval_secs,
            "scheduler starting"
        );

        let tasks = vec![
            self.spawn_baseline_job(shutdown_rx.clone()),
            self.spawn_feed_job(shutdown_rx.clone()),
            self.spawn_purge_job(shutdown_rx.clone()),
            self.spawn_prune_job(shutdown_rx),
        ];
        SchedulerHandle { shutdown_tx, tasks }
    }

    fn spawn_baseline_job(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let baselines = self.baselines.clone();
        let history = self.history.clone();
        let interval = Duration::from_secs(self.config.baseline_rebuild_interval_secs.max(1));
        let lookback = ChronoDuration::hours(self.config.baseline_lookback_hours as i64);
        let timeout = Duration::from_secs(self.config.baseline_rebuild_timeout_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pass = rebuild_pass(&baselines, history.as_ref(), lookback);
                        match tokio::time::timeout(timeout, pass).await {
                            Ok(()) => {}
                            Err(_) => error!("baseline rebuild timed out"),
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("baseline job stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_feed_job(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let feeds = self.feeds.clone();
        let interval = Duration::from_secs(self.config.feed_refresh_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = feeds.refresh_all().await;
                        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                        if failed > 0 {
                            warn!(failed, total = results.len(), "feed refresh pass had failures");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("feed job stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_purge_job(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let alerts = self.pipeline.alert_manager().clone();
        let interval = Duration::from_secs(self.config.alert_purge_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match alerts.purge_old_alerts().await {
                            Ok(purged) if purged > 0 => info!(purged, "purged expired alerts"),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "alert purge failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("purge job stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_prune_job(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let interval = Duration::from_secs(self.config.finding_prune_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pruned = pipeline.detectors().prune_findings(Utc::now());
                        if pruned > 0 {
                            debug!(pruned, "pruned stale findings");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("prune job stopping");
                        return;
                    }
                }
            }
        })
    }
}

/// One rebuild pass covers both directions; a failure in one direction does
/// not skip the other.
async fn rebuild_pass(
    baselines: &BaselineStore,
    history: &dyn FlowHistory,
    lookback: ChronoDuration,
) {
    let window_end = Utc::now();
    let window_start = window_end - lookback;
    for direction in [Direction::Source, Direction::Destination] {
        match baselines.rebuild(direction, history, window_start, window_end).await {
            Ok(hosts) => debug!(?direction, hosts, "baseline rebuild pass done"),
            Err(e) => error!(?direction, error = %e, "baseline rebuild failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertManager, DedupConfig, InMemoryAlertStore};
    use crate::baseline::{FlowRecord, InMemoryFlowHistory};
    use crate::bus::EventBus;
    use crate::detectors::{DetectorConfig, DetectorSet};
    use crate::feeds::StaticFetcher;
    use crate::ioc::{FeedDropPolicy, IocIndex, IocType};
    use crate::rules::RuleEngine;

    fn scheduler_under_test(history: Arc<InMemoryFlowHistory>) -> (Scheduler, Arc<BaselineStore>, Arc<IocIndex>) {
        let baselines = Arc::new(BaselineStore::new());
        let ioc_index = Arc::new(IocIndex::new(FeedDropPolicy::Deactivate));
        let alerts = Arc::new(AlertManager::new(
            Arc::new(InMemoryAlertStore::new()),
            DedupConfig::default(),
        ));
        let pipeline = Arc::new(DetectionPipeline::new(
            DetectorSet::new(DetectorConfig::default()),
            Arc::new(RuleEngine::new()),
            baselines.clone(),
            ioc_index.clone(),
            alerts,
            EventBus::default(),
        ));
        let feeds = Arc::new(FeedManager::new(
            ioc_index.clone(),
            Arc::new(StaticFetcher {
                payload: "value,type\nscheduled.example.com,domain\n".to_string(),
            }),
        ));
        feeds.register_feed(crate::feeds::FeedConfig {
            id: "feed-1".to_string(),
            name: "Scheduled feed".to_string(),
            url: "http://feeds.example.com/iocs".to_string(),
            format: crate::feeds::FeedFormat::Csv,
            enabled: true,
            api_key: None,
            field_mapping: Default::default(),
            default_type: None,
            default_confidence: 50,
            tags: vec![],
        });

        let config = SchedulerConfig {
            baseline_rebuild_interval_secs: 1,
            baseline_lookback_hours: 1,
            baseline_rebuild_timeout_secs: 5,
            feed_refresh_interval_secs: 1,
            alert_purge_interval_secs: 1,
            finding_prune_interval_secs: 1,
        };
        (
            Scheduler::new(config, pipeline, baselines.clone(), history, feeds),
            baselines,
            ioc_index,
        )
    }

    #[tokio::test]
    async fn test_jobs_run_once_at_startup() {
        let history = Arc::new(InMemoryFlowHistory::new());
        history.record(FlowRecord {
            source_ip: "10.0.0.1".to_string(),
            destination_ip: "203.0.113.5".to_string(),
            destination_port: Some(443),
            protocol: Some("tcp".to_string()),
            bytes: 1_000,
            packets: 10,
            timestamp: Utc::now(),
        });

        let (scheduler, baselines, ioc_index) = scheduler_under_test(history);
        let handle = scheduler.start();

        // Intervals tick immediately; give the first pass a moment.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        assert!(baselines.get("10.0.0.1", Direction::Source).is_some());
        assert!(ioc_index.lookup(IocType::Domain, "scheduled.example.com").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_jobs() {
        let history = Arc::new(InMemoryFlowHistory::new());
        let (scheduler, _baselines, _ioc) = scheduler_under_test(history);
        let handle = scheduler.start();
        // Must complete promptly even with 1s intervals pending.
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
