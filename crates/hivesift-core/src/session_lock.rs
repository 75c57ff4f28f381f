//! Per-session mutual exclusion.
//!
//! Overlapping queries on one session would race the store update;
//! each run holds its session's lock from fetch through update. An
//! optional global limit bounds concurrent runs across all sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Default)]
pub struct SessionLockManager {
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    global: Option<Arc<Semaphore>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_limit(max_concurrent: usize) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            global: Some(Arc::new(Semaphore::new(max_concurrent.max(1)))),
        }
    }

    /// Blocks until this session is free (and a global slot opens, when
    /// limited). The guard releases both on drop.
    pub async fn acquire(&self, session_id: &str) -> SessionLockGuard {
        let global_permit = match &self.global {
            Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore closed")),
            None => None,
        };

        let session_sem = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let session_permit = session_sem.acquire_owned().await.expect("semaphore closed");

        SessionLockGuard {
            _session_permit: session_permit,
            _global_permit: global_permit,
        }
    }
}

pub struct SessionLockGuard {
    _session_permit: OwnedSemaphorePermit,
    _global_permit: Option<OwnedSemaphorePermit>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_session_is_serialized() {
        let manager = SessionLockManager::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let m1 = manager.clone();
        let c1 = counter.clone();
        let t1 = tokio::spawn(async move {
            let _guard = m1.acquire("s1").await;
            c1.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            c1.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let m2 = manager.clone();
        let c2 = counter.clone();
        let t2 = tokio::spawn(async move {
            let _guard = m2.acquire("s1").await;
            assert!(c2.load(Ordering::SeqCst) >= 2);
            c2.fetch_add(1, Ordering::SeqCst);
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn different_sessions_run_in_parallel() {
        let manager = SessionLockManager::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let m1 = manager.clone();
        let c1 = counter.clone();
        let t1 = tokio::spawn(async move {
            let _guard = m1.acquire("s1").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            c1.fetch_add(1, Ordering::SeqCst);
        });

        let m2 = manager.clone();
        let c2 = counter.clone();
        let t2 = tokio::spawn(async move {
            let _guard = m2.acquire("s2").await;
            c2.fetch_add(1, Ordering::SeqCst);
        });

        t2.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        t1.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn global_limit_caps_concurrency() {
        let manager = SessionLockManager::with_global_limit(2);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let manager = manager.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    let _guard = manager.acquire(&format!("s{i}")).await;
                    let current = in_flight.fetch_add(1, Ordering::SeqCst);
                    assert!(current < 2);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.await.unwrap();
        }
    }
}
