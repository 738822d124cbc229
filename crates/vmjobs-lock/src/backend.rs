use async_trait::async_trait;

use crate::error::Result;

/// A shared store that hands out lock sessions.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Opens an independent session. Locks taken through it are released when
    /// it is dropped, even without an explicit unlock.
    async fn open_session(&self) -> Result<Box<dyn LockSession>>;
}

/// One connection-like session against the lock store.
#[async_trait]
pub trait LockSession: Send {
    /// Non-blocking. `false` means another session holds the lock.
    async fn try_lock(&mut self, lock_id: i64) -> Result<bool>;

    /// Returns whether this session actually held the lock.
    async fn unlock(&mut self, lock_id: i64) -> Result<bool>;
}
