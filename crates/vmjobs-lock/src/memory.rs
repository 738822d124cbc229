use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{LockBackend, LockSession};
use crate::error::Result;

type Holders = Arc<Mutex<HashMap<i64, u64>>>;

/// In-process lock store with the same session semantics as the PostgreSQL
/// backend. Used in tests and for single-process deployments.
#[derive(Default)]
pub struct MemoryLockBackend {
    holders: Holders,
    next_session: AtomicU64,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, lock_id: i64) -> bool {
        self.holders.lock().unwrap().contains_key(&lock_id)
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_session(&self) -> Result<Box<dyn LockSession>> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            id,
            holders: Arc::clone(&self.holders),
            held: HashSet::new(),
        }))
    }
}

struct MemorySession {
    id: u64,
    holders: Holders,
    held: HashSet<i64>,
}

#[async_trait]
impl LockSession for MemorySession {
    async fn try_lock(&mut self, lock_id: i64) -> Result<bool> {
        let mut holders = self.holders.lock().unwrap();
        match holders.get(&lock_id) {
            Some(owner) if *owner != self.id => Ok(false),
            _ => {
                holders.insert(lock_id, self.id);
                self.held.insert(lock_id);
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, lock_id: i64) -> Result<bool> {
        let mut holders = self.holders.lock().unwrap();
        if holders.get(&lock_id) == Some(&self.id) {
            holders.remove(&lock_id);
            self.held.remove(&lock_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut holders = self.holders.lock().unwrap();
        for lock_id in self.held.drain() {
            if holders.get(&lock_id) == Some(&self.id) {
                holders.remove(&lock_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_session_is_refused() {
        let backend = MemoryLockBackend::new();
        let mut a = backend.open_session().await.unwrap();
        let mut b = backend.open_session().await.unwrap();

        assert!(a.try_lock(42).await.unwrap());
        assert!(!b.try_lock(42).await.unwrap());
        // The refused session does not touch the holder.
        assert!(!b.unlock(42).await.unwrap());
        assert!(backend.is_held(42));

        assert!(a.unlock(42).await.unwrap());
        assert!(b.try_lock(42).await.unwrap());
    }

    #[tokio::test]
    async fn dropping_session_frees_its_locks() {
        let backend = MemoryLockBackend::new();
        let mut a = backend.open_session().await.unwrap();
        assert!(a.try_lock(7).await.unwrap());
        drop(a);
        assert!(!backend.is_held(7));
    }
}
