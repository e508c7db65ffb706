//! Background jobs
//!
//! Everything slow (cloud provider calls, analysis passes, teardown) runs as a
//! job so the request path never waits on it. Delivery is at-least-once, so
//! every job must be safe to run again.

mod local;
mod runner;

pub use local::LocalJobQueue;
pub use runner::JobRunner;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// Create servers until the source has `desired_total` proxies
    ProvisionProxies {
        site_id: Option<i64>,
        source_id: i64,
        desired_total: i64,
    },
    /// Tear down a proxy nobody uses any more
    DecommissionProxy { proxy_id: i64 },
    /// Adopt ready servers that have no proxy row yet
    FindOrphanedServers {
        source_id: i64,
        site_id: Option<i64>,
        desired_total: i64,
        #[serde(default)]
        attempt: u32,
    },
    /// Judge one proxy on one site
    TargetedPerformanceAnalyzer { site_id: i64, proxy_id: i64 },
    /// Fan out a site analysis for every site
    GlobalPerformanceAnalyzer,
    /// Judge every proxy of a site and backfill
    SitePerformanceAnalyzer { site_id: i64 },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::ProvisionProxies { .. } => "provision_proxies",
            Job::DecommissionProxy { .. } => "decommission_proxy",
            Job::FindOrphanedServers { .. } => "find_orphaned_servers",
            Job::TargetedPerformanceAnalyzer { .. } => "targeted_performance_analyzer",
            Job::GlobalPerformanceAnalyzer => "global_performance_analyzer",
            Job::SitePerformanceAnalyzer { .. } => "site_performance_analyzer",
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Enqueue after `delay` has passed
    async fn enqueue_in(&self, delay: Duration, job: Job) -> Result<()>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Queue that only records what was enqueued
    #[derive(Default)]
    pub struct RecordingJobQueue {
        jobs: Mutex<Vec<(Option<Duration>, Job)>>,
        refused: Mutex<Vec<&'static str>>,
    }

    impl RecordingJobQueue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn jobs(&self) -> Vec<Job> {
            self.jobs.lock().iter().map(|(_, j)| j.clone()).collect()
        }

        pub fn delayed(&self) -> Vec<(Duration, Job)> {
            self.jobs
                .lock()
                .iter()
                .filter_map(|(d, j)| d.map(|d| (d, j.clone())))
                .collect()
        }

        pub fn take(&self) -> Vec<Job> {
            self.jobs.lock().drain(..).map(|(_, j)| j).collect()
        }

        /// Fail every later enqueue of jobs named `name`
        pub fn refuse(&self, name: &'static str) {
            self.refused.lock().push(name);
        }

        fn push(&self, delay: Option<Duration>, job: Job) -> Result<()> {
            if self.refused.lock().contains(&job.name()) {
                return Err(crate::error::ZartanError::JobQueueClosed);
            }
            self.jobs.lock().push((delay, job));
            Ok(())
        }
    }

    #[async_trait]
    impl JobQueue for RecordingJobQueue {
        async fn enqueue(&self, job: Job) -> Result<()> {
            self.push(None, job)
        }

        async fn enqueue_in(&self, delay: Duration, job: Job) -> Result<()> {
            self.push(Some(delay), job)
        }
    }
}
