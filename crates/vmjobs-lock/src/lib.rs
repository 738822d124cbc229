//! Cross-process mutual exclusion for job runs.
//!
//! A job's lock lives in a shared store and is tied to the session that took
//! it. When the session ends (explicit release, dropped guard, or a crashed
//! process whose connection the server reaps) the lock is free again.

pub mod backend;
pub mod error;
pub mod id;
pub mod manager;
pub mod memory;
pub mod postgres;

pub use backend::{LockBackend, LockSession};
pub use error::{LockError, Result};
pub use id::derive_lock_id;
pub use manager::{LockGuard, LockManager};
pub use memory::MemoryLockBackend;
pub use postgres::PgLockBackend;
