use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, instrument};

use super::{Job, JobQueue};
use crate::error::Result;
use crate::health::HealthTracker;
use crate::sources::SourceManager;
use crate::store::DurableStore;

/// Executes jobs with at most `workers` running at once
pub struct JobRunner {
    durable: Arc<dyn DurableStore>,
    jobs: Arc<dyn JobQueue>,
    health: HealthTracker,
    sources: SourceManager,
    workers: usize,
}

impl JobRunner {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        jobs: Arc<dyn JobQueue>,
        health: HealthTracker,
        sources: SourceManager,
        workers: usize,
    ) -> Self {
        Self {
            durable,
            jobs,
            health,
            sources,
            workers: workers.max(1),
        }
    }

    /// Drain `rx` until shutdown, then wait for running jobs to finish
    #[instrument(skip(self, rx, shutdown))]
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Job>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting job runner ({} workers)", self.workers);
        let permits = Arc::new(Semaphore::new(self.workers));

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(job) = received else {
                        break;
                    };
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let runner = self.clone();
                    tokio::spawn(async move {
                        runner.process(job).await;
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Job runner shutting down");
                        break;
                    }
                }
            }
        }

        let _ = permits.acquire_many(self.workers as u32).await;
    }

    /// Run a job, logging instead of returning its error
    pub async fn process(&self, job: Job) {
        let name = job.name();
        debug!(job = name, "Running job");
        if let Err(e) = self.execute(job).await {
            error!(job = name, error = %e, "Job failed");
        }
    }

    pub async fn execute(&self, job: Job) -> Result<()> {
        match job {
            Job::ProvisionProxies {
                site_id,
                source_id,
                desired_total,
            } => {
                self.sources
                    .provision(source_id, site_id, desired_total)
                    .await
            }
            Job::DecommissionProxy { proxy_id } => self.sources.decommission_proxy(proxy_id).await,
            Job::FindOrphanedServers {
                source_id,
                site_id,
                desired_total,
                attempt,
            } => {
                self.sources
                    .find_orphaned_servers(source_id, site_id, desired_total, attempt)
                    .await
            }
            Job::TargetedPerformanceAnalyzer { site_id, proxy_id } => {
                self.health.analyze_proxy(site_id, proxy_id).await?;
                Ok(())
            }
            Job::GlobalPerformanceAnalyzer => {
                let sites = self.durable.list_sites().await?;
                debug!(count = sites.len(), "Fanning out site analysis");
                for site in sites {
                    self.jobs
                        .enqueue(Job::SitePerformanceAnalyzer { site_id: site.id })
                        .await?;
                }
                Ok(())
            }
            Job::SitePerformanceAnalyzer { site_id } => {
                self.health.analyze_site(site_id).await?;
                Ok(())
            }
        }
    }
}
