//! Per-request writer locks
//!
//! Every read-modify-write of a withdraw request happens while holding the
//! request's mutex. External calls are made with the guard dropped.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of one async mutex per request id
#[derive(Clone, Default)]
pub struct RequestLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a request
    pub async fn acquire(&self, request_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(request_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on; returns how many were removed
    pub async fn prune(&self) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_request_is_serialized() {
        let locks = RequestLocks::new();
        let guard = locks.acquire("wr_1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("wr_1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_requests_do_not_block() {
        let locks = RequestLocks::new();
        let _a = locks.acquire("wr_1").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("wr_2"))
            .await
            .expect("independent request must not wait");
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = RequestLocks::new();
        let held = locks.acquire("wr_1").await;
        drop(locks.acquire("wr_2").await);

        assert_eq!(locks.prune().await, 1);
        assert_eq!(locks.len().await, 1);

        drop(held);
        assert_eq!(locks.prune().await, 1);
    }
}
