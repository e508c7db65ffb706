//! Periodic analysis scheduler
//!
//! Enqueues a `GlobalPerformanceAnalyzer` job every interval. The job fans
//! out one site analysis per site, which folds counters into the durable
//! store, evicts failing proxies and tops every pool back up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, instrument};

use crate::jobs::{Job, JobQueue};

/// Analysis scheduler configuration
#[derive(Clone)]
pub struct AnalysisSchedulerConfig {
    /// How often every site is analyzed
    pub interval: Duration,
}

impl Default for AnalysisSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

pub struct AnalysisScheduler {
    jobs: Arc<dyn JobQueue>,
    config: AnalysisSchedulerConfig,
}

impl AnalysisScheduler {
    pub fn new(jobs: Arc<dyn JobQueue>, config: AnalysisSchedulerConfig) -> Self {
        Self { jobs, config }
    }

    /// Run the scheduler; the first analysis is queued immediately
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting analysis scheduler (interval: {}s)",
            self.config.interval.as_secs()
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.jobs.enqueue(Job::GlobalPerformanceAnalyzer).await {
                        error!("Failed to queue global analysis: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Analysis scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for stopping the analysis scheduler
pub struct AnalysisSchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl AnalysisSchedulerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for AnalysisSchedulerHandle {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::RecordingJobQueue;

    #[tokio::test(start_paused = true)]
    async fn test_queues_global_analysis_each_interval() {
        let jobs = Arc::new(RecordingJobQueue::new());
        let scheduler = AnalysisScheduler::new(
            jobs.clone(),
            AnalysisSchedulerConfig {
                interval: Duration::from_secs(60),
            },
        );
        let (handle, shutdown) = AnalysisSchedulerHandle::new();
        let task = tokio::spawn(async move { scheduler.run(shutdown).await });

        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.shutdown();
        task.await.unwrap();

        assert_eq!(
            jobs.jobs(),
            vec![Job::GlobalPerformanceAnalyzer; 3]
        );
    }
}
