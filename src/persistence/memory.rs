//! In-memory [`PersistenceStore`] for tests and dry runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{PersistenceStore, StoreError};
use crate::position::CachedPosition;

#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: Mutex<HashMap<String, CachedPosition>>,
    state: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with positions, as if written by an earlier run.
    pub fn with_positions(positions: impl IntoIterator<Item = CachedPosition>) -> Self {
        let store = Self::default();
        store
            .positions
            .lock()
            .extend(positions.into_iter().map(|p| (p.key.clone(), p)));
        store
    }

    /// Make every subsequent write fail with a non-transient error.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Number of successful write calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<CachedPosition> {
        self.positions.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.lock().is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PersistenceStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<CachedPosition>, StoreError> {
        Ok(self.positions.lock().values().cloned().collect())
    }

    fn save(&self, position: &CachedPosition) -> Result<(), StoreError> {
        self.check_writable()?;
        self.positions
            .lock()
            .insert(position.key.clone(), position.clone());
        Ok(())
    }

    fn save_batch(&self, positions: &[CachedPosition]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut stored = self.positions.lock();
        for pos in positions {
            stored.insert(pos.key.clone(), pos.clone());
        }
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut stored = self.positions.lock();
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().get(key).cloned())
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
