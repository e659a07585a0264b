//! Persistence for the position cache and scheduler bookkeeping.
//!
//! The monitor writes through to a [`PersistenceStore`] on every cache mutation
//! so a restart can resume from the last known tier layout:
//! - `SqliteStore`: durable store backed by a local SQLite file
//! - `MemoryStore`: in-process store for tests and dry runs

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::position::CachedPosition;

/// State key holding the RFC 3339 timestamp of the last discovery sweep.
pub const STATE_LAST_DISCOVERY: &str = "last_discovery";
/// State key holding the JSON array of known wallet addresses.
pub const STATE_KNOWN_ADDRESSES: &str = "known_addresses";
/// State key holding the JSON array of manually watched wallet addresses.
pub const STATE_WATCHED_ADDRESSES: &str = "watched_addresses";

/// Errors raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database is locked by another writer; safe to retry.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Busy(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Storage contract for cached positions and generic key/value state.
///
/// Upserts are keyed by `position_key` and must be idempotent.
pub trait PersistenceStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<CachedPosition>, StoreError>;

    fn save(&self, position: &CachedPosition) -> Result<(), StoreError>;

    fn save_batch(&self, positions: &[CachedPosition]) -> Result<(), StoreError>;

    fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    fn get_state(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Bounded exponential backoff for transient store errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying while it fails with a transient error.
    ///
    /// Store calls are synchronous, so the backoff sleeps the calling thread.
    /// On a multi-threaded tokio runtime the wait is moved off the worker
    /// with `block_in_place`.
    pub fn run<T>(
        &self,
        op_name: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying"
                    );
                    backoff_sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn backoff_sleep(delay: Duration) {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(delay))
        }
        _ => std::thread::sleep(delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_retry_recovers_from_busy() {
        let calls = Cell::new(0);
        let result = fast_policy().run("save", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Busy("locked".to_string()))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_inside_multi_thread_runtime() {
        let calls = Cell::new(0);
        let result = fast_policy().run("save", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(StoreError::Busy("locked".to_string()))
            } else {
                Ok("saved")
            }
        });

        assert_eq!(result.unwrap(), "saved");
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_retry_inside_current_thread_runtime() {
        let calls = Cell::new(0);
        let result = fast_policy().run("save", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(StoreError::Busy("locked".to_string()))
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_retry_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast_policy().run("save", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Busy("locked".to_string()))
        });

        assert!(matches!(result, Err(StoreError::Busy(_))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_non_transient_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast_policy().run("save", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Unavailable("disk full".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
    }
}
