use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{LockBackend, LockSession};
use crate::error::Result;
use crate::id::derive_lock_id;

/// Gates job runs on a per-job advisory lock.
///
/// Without a backend the manager runs in degraded mode: every acquisition
/// succeeds and only in-process guards protect against overlap.
#[derive(Clone)]
pub struct LockManager {
    backend: Option<Arc<dyn LockBackend>>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn unlocked() -> Self {
        warn!("No lock store configured, running without cross-process locking");
        Self { backend: None }
    }

    pub fn is_degraded(&self) -> bool {
        self.backend.is_none()
    }

    /// Tries to take the job's lock without waiting.
    ///
    /// `Ok(None)` means another session holds it and the caller should skip
    /// this tick.
    pub async fn try_acquire(&self, job_id: &str) -> Result<Option<LockGuard>> {
        let lock_id = derive_lock_id(job_id);
        let Some(backend) = &self.backend else {
            debug!(job_id, "Lock skipped (degraded mode)");
            return Ok(Some(LockGuard {
                job_id: job_id.to_string(),
                lock_id,
                session: None,
            }));
        };

        let mut session = backend.open_session().await?;
        if session.try_lock(lock_id).await? {
            debug!(job_id, lock_id, backend = backend.name(), "Advisory lock acquired");
            Ok(Some(LockGuard {
                job_id: job_id.to_string(),
                lock_id,
                session: Some(session),
            }))
        } else {
            warn!(job_id, lock_id, "Could not acquire advisory lock, job already running");
            Ok(None)
        }
    }

    /// Runs `f` while holding the job's lock and releases it afterwards.
    ///
    /// Returns `Ok(None)` without running `f` when the lock is contended.
    pub async fn run_exclusive<F, Fut, T>(&self, job_id: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.try_acquire(job_id).await? else {
            return Ok(None);
        };
        let out = f().await;
        guard.release().await;
        Ok(Some(out))
    }
}

/// Proof of holding a job's lock.
///
/// Prefer [`LockGuard::release`]. Dropping the guard closes the session
/// instead, which frees the lock just the same.
pub struct LockGuard {
    job_id: String,
    lock_id: i64,
    session: Option<Box<dyn LockSession>>,
}

impl LockGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Unlocks and ends the session. Never fails: if the unlock query errors,
    /// dropping the session still frees the lock.
    pub async fn release(mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match session.unlock(self.lock_id).await {
            Ok(true) => debug!(job_id = %self.job_id, lock_id = self.lock_id, "Advisory lock released"),
            Ok(false) => warn!(job_id = %self.job_id, lock_id = self.lock_id, "Advisory lock was not held at release"),
            Err(e) => warn!(job_id = %self.job_id, error = %e, "Unlock failed, closing session"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.session.is_some() {
            debug!(job_id = %self.job_id, "Lock guard dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockBackend;

    fn manager() -> (LockManager, Arc<MemoryLockBackend>) {
        let backend = Arc::new(MemoryLockBackend::new());
        (LockManager::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn contended_acquire_returns_none() {
        let (locks, _) = manager();
        let held = locks.try_acquire("job_a").await.unwrap();
        assert!(held.is_some());
        assert!(locks.try_acquire("job_a").await.unwrap().is_none());
        // Different job, different key.
        assert!(locks.try_acquire("job_b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_acquires_exactly_one_wins() {
        let (locks, _) = manager();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.try_acquire("job_race").await.unwrap()
            }));
        }
        let mut guards = Vec::new();
        for h in handles {
            if let Some(g) = h.await.unwrap() {
                guards.push(g);
            }
        }
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn release_and_drop_both_free_the_lock() {
        let (locks, backend) = manager();
        let id = derive_lock_id("job_a");

        let guard = locks.try_acquire("job_a").await.unwrap().unwrap();
        assert!(backend.is_held(id));
        guard.release().await;
        assert!(!backend.is_held(id));

        let guard = locks.try_acquire("job_a").await.unwrap().unwrap();
        drop(guard);
        assert!(!backend.is_held(id));
    }

    #[tokio::test]
    async fn run_exclusive_releases_after_body() {
        let (locks, backend) = manager();
        let out = locks.run_exclusive("job_a", || async { 5 }).await.unwrap();
        assert_eq!(out, Some(5));
        assert!(!backend.is_held(derive_lock_id("job_a")));

        let _held = locks.try_acquire("job_a").await.unwrap().unwrap();
        let skipped = locks.run_exclusive("job_a", || async { 6 }).await.unwrap();
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn degraded_mode_always_acquires() {
        let locks = LockManager::unlocked();
        assert!(locks.is_degraded());
        let _a = locks.try_acquire("job_a").await.unwrap().unwrap();
        assert!(locks.try_acquire("job_a").await.unwrap().is_some());
    }
}
