use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::FastStore;
use crate::error::Result;

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Advisory lock over the fast store with bounded wait and bounded hold.
///
/// The hold expiration applies even if the holder dies, so a crashed worker
/// can never wedge a site's pool.
#[derive(Clone)]
pub struct AdvisoryLock {
    store: Arc<dyn FastStore>,
    expiration: Duration,
    wait: Duration,
}

/// A held lock. Call `release` when done; dropping it leaves the key to expire.
#[must_use = "the lock is held until released or expired"]
pub struct LockGuard {
    store: Arc<dyn FastStore>,
    key: String,
    token: String,
}

impl AdvisoryLock {
    pub fn new(store: Arc<dyn FastStore>, expiration: Duration, wait: Duration) -> Self {
        Self {
            store,
            expiration,
            wait,
        }
    }

    /// Try to take `key` until the wait bound elapses; `None` on timeout
    pub async fn acquire(&self, key: &str) -> Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;

        loop {
            if self.store.set_nx_px(key, &token, self.expiration).await? {
                debug!(key, "Acquired lock");
                return Ok(Some(LockGuard {
                    store: self.store.clone(),
                    key: key.to_string(),
                    token,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(key, wait_ms = self.wait.as_millis() as u64, "Timed out waiting for lock");
                return Ok(None);
            }
            sleep(RETRY_DELAY.min(deadline - now)).await;
        }
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock; false if it had already expired or been taken over
    pub async fn release(self) -> Result<bool> {
        let released = self.store.del_if_eq(&self.key, &self.token).await?;
        if !released {
            warn!(key = %self.key, "Lock expired before release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fast_store::MemoryFastStore;

    fn lock(wait: Duration) -> (Arc<ManualClock>, AdvisoryLock) {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_000));
        let store: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new(clock.clone()));
        (
            clock,
            AdvisoryLock::new(store, Duration::from_secs(60), wait),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (_, lock) = lock(Duration::from_millis(10));

        let guard = lock.acquire("site:1:lock").await.unwrap().unwrap();
        assert_eq!(guard.key(), "site:1:lock");
        assert!(guard.release().await.unwrap());

        let again = lock.acquire("site:1:lock").await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let (_, lock) = lock(Duration::from_millis(20));

        let _held = lock.acquire("site:1:lock").await.unwrap().unwrap();
        let second = lock.acquire("site:1:lock").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let (clock, lock) = lock(Duration::from_millis(10));

        let stale = lock.acquire("site:1:lock").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(60));

        let fresh = lock.acquire("site:1:lock").await.unwrap().unwrap();
        assert!(!stale.release().await.unwrap());
        assert!(fresh.release().await.unwrap());
    }
}
