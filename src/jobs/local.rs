use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Job, JobQueue};
use crate::error::{Result, ZartanError};

/// In-process queue; `JobRunner` drains the receiving end
#[derive(Clone)]
pub struct LocalJobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl LocalJobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.tx.send(job).map_err(|_| ZartanError::JobQueueClosed)
    }

    async fn enqueue_in(&self, delay: Duration, job: Job) -> Result<()> {
        if self.tx.is_closed() {
            return Err(ZartanError::JobQueueClosed);
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(job) {
                warn!(job = e.0.name(), "Queue closed before delayed job was due");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_delivers_in_order() {
        let (queue, mut rx) = LocalJobQueue::new();
        tokio_test::assert_ok!(queue.enqueue(Job::GlobalPerformanceAnalyzer).await);
        tokio_test::assert_ok!(
            queue
                .enqueue(Job::SitePerformanceAnalyzer { site_id: 1 })
                .await
        );

        assert_eq!(rx.recv().await, Some(Job::GlobalPerformanceAnalyzer));
        assert_eq!(
            rx.recv().await,
            Some(Job::SitePerformanceAnalyzer { site_id: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_in_waits_for_delay() {
        let (queue, mut rx) = LocalJobQueue::new();
        queue
            .enqueue_in(Duration::from_secs(10), Job::DecommissionProxy { proxy_id: 4 })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(Job::DecommissionProxy { proxy_id: 4 }));
    }

    #[tokio::test]
    async fn test_closed_queue_errors() {
        let (queue, rx) = LocalJobQueue::new();
        drop(rx);

        assert!(matches!(
            queue.enqueue(Job::GlobalPerformanceAnalyzer).await,
            Err(ZartanError::JobQueueClosed)
        ));
        assert!(matches!(
            queue
                .enqueue_in(Duration::from_secs(1), Job::GlobalPerformanceAnalyzer)
                .await,
            Err(ZartanError::JobQueueClosed)
        ));
    }
}
