use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{debug, info, warn};

use crate::backend::{LockBackend, LockSession};
use crate::error::{LockError, Result};

/// PostgreSQL session-level advisory locks.
///
/// Every session checks out its own pooled connection. A session-level lock
/// is held as long as that connection stays open, so a crashed process frees
/// its locks as soon as the server notices the dropped socket.
pub struct PgLockBackend {
    pool: PgPool,
}

impl PgLockBackend {
    pub async fn connect(url: &str, max_connections: u32, connect_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await
            .map_err(|e| LockError::Connect(e.to_string()))?;
        info!(max_connections, "Advisory lock store connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for PgLockBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn open_session(&self) -> Result<Box<dyn LockSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession {
            conn: Some(conn),
            held: HashSet::new(),
        }))
    }
}

struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    held: HashSet<i64>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>> {
        self.conn
            .as_mut()
            .ok_or_else(|| LockError::Query("session already closed".to_string()))
    }
}

#[async_trait]
impl LockSession for PgSession {
    async fn try_lock(&mut self, lock_id: i64) -> Result<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut **self.conn()?)
            .await?;
        if acquired {
            self.held.insert(lock_id);
        }
        Ok(acquired)
    }

    async fn unlock(&mut self, lock_id: i64) -> Result<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut **self.conn()?)
            .await?;
        self.held.remove(&lock_id);
        Ok(released)
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.held.is_empty() {
            // Clean connection goes back to the pool.
            drop(conn);
            return;
        }
        // Returning a connection with locks still held would leak them to the
        // next borrower. Closing the socket makes the server release them.
        warn!(locks = ?self.held, "Closing lock session with locks still held");
        drop(conn.detach());
        debug!("Lock session connection detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::derive_lock_id;

    async fn backend() -> Option<PgLockBackend> {
        let url = std::env::var("VMJOBS_TEST_PG_URL").ok()?;
        PgLockBackend::connect(&url, 4, Duration::from_secs(5)).await.ok()
    }

    #[tokio::test]
    #[ignore = "needs VMJOBS_TEST_PG_URL"]
    async fn two_sessions_exclusive() {
        let Some(backend) = backend().await else {
            return;
        };
        let id = derive_lock_id("pg_two_sessions_exclusive");
        let mut a = backend.open_session().await.unwrap();
        let mut b = backend.open_session().await.unwrap();

        assert!(a.try_lock(id).await.unwrap());
        assert!(!b.try_lock(id).await.unwrap());
        assert!(a.unlock(id).await.unwrap());
        assert!(b.try_lock(id).await.unwrap());
        assert!(b.unlock(id).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs VMJOBS_TEST_PG_URL"]
    async fn dropped_session_releases_lock() {
        let Some(backend) = backend().await else {
            return;
        };
        let id = derive_lock_id("pg_dropped_session_releases_lock");
        let mut a = backend.open_session().await.unwrap();
        assert!(a.try_lock(id).await.unwrap());
        drop(a);

        // The server reaps the closed backend asynchronously.
        let mut b = backend.open_session().await.unwrap();
        let mut acquired = false;
        for _ in 0..50 {
            if b.try_lock(id).await.unwrap() {
                acquired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(acquired);
        b.unlock(id).await.unwrap();
    }
}
