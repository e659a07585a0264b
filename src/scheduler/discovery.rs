//! Adaptive discovery scheduling.
//!
//! Discovery and targeted refresh draw on the same request budget. The sweep
//! interval therefore stretches as the Critical and High tiers fill up, and
//! the known-address set only ever grows so a wallet that closes everything
//! is still rechecked for new positions on later sweeps.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::TierCounts;
use crate::persistence::{PersistenceStore, StoreError, STATE_KNOWN_ADDRESSES, STATE_LAST_DISCOVERY};

/// Interval bounds and tier weights, in minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoverySettings {
    pub min_interval_minutes: i64,
    pub max_interval_minutes: i64,
    pub critical_weight: i64,
    pub high_weight: i64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            min_interval_minutes: 30,
            max_interval_minutes: 240,
            critical_weight: 15,
            high_weight: 5,
        }
    }
}

pub struct DiscoveryScheduler {
    settings: DiscoverySettings,
    known: HashSet<String>,
    last_discovery: Option<DateTime<Utc>>,
    forced: bool,
    store: Arc<dyn PersistenceStore>,
}

impl DiscoveryScheduler {
    pub fn new(settings: DiscoverySettings, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            settings,
            known: HashSet::new(),
            last_discovery: None,
            forced: false,
            store,
        }
    }

    /// Load the known-address set and last sweep time from the store.
    ///
    /// Unreadable state is treated as absent.
    pub fn restore(&mut self) -> Result<(), StoreError> {
        if let Some(raw) = self.store.get_state(STATE_LAST_DISCOVERY)? {
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => self.last_discovery = Some(at.with_timezone(&Utc)),
                Err(e) => warn!(value = %raw, error = %e, "Ignoring unreadable last_discovery"),
            }
        }

        if let Some(raw) = self.store.get_state(STATE_KNOWN_ADDRESSES)? {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(addresses) => self.known.extend(addresses),
                Err(e) => warn!(error = %e, "Ignoring unreadable known address set"),
            }
        }

        info!(
            known_addresses = self.known.len(),
            last_discovery = ?self.last_discovery,
            "Restored discovery state"
        );
        Ok(())
    }

    /// Current sweep interval given tier pressure.
    pub fn interval_minutes(&self, counts: &TierCounts) -> i64 {
        let s = &self.settings;
        let raw = s.min_interval_minutes
            + counts.critical as i64 * s.critical_weight
            + counts.high as i64 * s.high_weight;
        raw.clamp(s.min_interval_minutes, s.max_interval_minutes)
    }

    pub fn should_run(&self, counts: &TierCounts) -> bool {
        self.should_run_at(counts, Utc::now())
    }

    pub fn should_run_at(&self, counts: &TierCounts, now: DateTime<Utc>) -> bool {
        if self.forced {
            return true;
        }
        match self.last_discovery {
            None => true,
            Some(last) => now - last > Duration::minutes(self.interval_minutes(counts)),
        }
    }

    /// Request a sweep on the next check regardless of the interval.
    pub fn force(&mut self) {
        self.forced = true;
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Candidates not yet in the known set, in input order, deduplicated.
    pub fn find_new(&self, candidates: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        candidates
            .iter()
            .filter(|a| !self.known.contains(*a) && seen.insert(a.as_str()))
            .cloned()
            .collect()
    }

    pub fn mark_complete(&mut self, new_addresses: &[String]) -> Result<(), StoreError> {
        self.mark_complete_at(new_addresses, Utc::now())
    }

    /// Record a finished sweep and grow the known set.
    ///
    /// The in-memory state is updated even if persisting it fails.
    pub fn mark_complete_at(&mut self, new_addresses: &[String], now: DateTime<Utc>) -> Result<(), StoreError> {
        self.last_discovery = Some(self.last_discovery.map_or(now, |prev| prev.max(now)));
        self.forced = false;
        let added = self.insert_known(new_addresses);

        info!(
            new_addresses = added,
            known_addresses = self.known.len(),
            "Discovery sweep complete"
        );

        self.store
            .set_state(STATE_LAST_DISCOVERY, &now.to_rfc3339())?;
        if added > 0 {
            self.persist_known()?;
        }
        Ok(())
    }

    /// Add addresses to the known set outside a sweep. Returns how many were new.
    pub fn remember(&mut self, addresses: &[String]) -> Result<usize, StoreError> {
        let added = self.insert_known(addresses);
        if added > 0 {
            self.persist_known()?;
        }
        Ok(added)
    }

    fn insert_known(&mut self, addresses: &[String]) -> usize {
        addresses
            .iter()
            .filter(|a| self.known.insert((*a).clone()))
            .count()
    }

    /// Write the known set, merged with whatever another process stored since
    /// this one last read it.
    fn persist_known(&mut self) -> Result<(), StoreError> {
        if let Some(raw) = self.store.get_state(STATE_KNOWN_ADDRESSES)? {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(stored) => self.known.extend(stored),
                Err(e) => warn!(error = %e, "Overwriting unreadable known address set"),
            }
        }
        let mut known: Vec<&String> = self.known.iter().collect();
        known.sort();
        self.store
            .set_state(STATE_KNOWN_ADDRESSES, &serde_json::to_string(&known)?)
    }

    pub fn is_known(&self, address: &str) -> bool {
        self.known.contains(address)
    }

    pub fn known_addresses(&self) -> &HashSet<String> {
        &self.known
    }

    pub fn last_discovery(&self) -> Option<DateTime<Utc>> {
        self.last_discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::Duration;

    fn scheduler(store: Arc<MemoryStore>) -> DiscoveryScheduler {
        DiscoveryScheduler::new(DiscoverySettings::default(), store)
    }

    fn counts(critical: usize, high: usize) -> TierCounts {
        TierCounts {
            critical,
            high,
            normal: 0,
        }
    }

    #[test]
    fn test_interval_scales_with_pressure() {
        let s = scheduler(Arc::new(MemoryStore::new()));
        assert_eq!(s.interval_minutes(&counts(0, 0)), 30);
        assert_eq!(s.interval_minutes(&counts(2, 3)), 75);
        assert_eq!(s.interval_minutes(&counts(50, 0)), 240);
    }

    #[test]
    fn test_should_run_after_interval() {
        let mut s = scheduler(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        assert!(s.should_run_at(&counts(0, 0), now));

        s.mark_complete_at(&[], now).unwrap();
        assert!(!s.should_run_at(&counts(0, 0), now + Duration::minutes(29)));
        assert!(!s.should_run_at(&counts(0, 0), now + Duration::minutes(30)));
        assert!(s.should_run_at(&counts(0, 0), now + Duration::minutes(30) + Duration::seconds(1)));
        // Pressure stretches the interval
        assert!(!s.should_run_at(&counts(2, 3), now + Duration::minutes(60)));
    }

    #[test]
    fn test_force_overrides_interval() {
        let mut s = scheduler(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        s.mark_complete_at(&[], now).unwrap();
        s.force();
        assert!(s.should_run_at(&counts(0, 0), now));

        s.mark_complete_at(&[], now).unwrap();
        assert!(!s.is_forced());
    }

    #[test]
    fn test_known_set_is_monotonic_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut s = scheduler(store.clone());

        let candidates = vec!["0xa".to_string(), "0xb".to_string(), "0xa".to_string()];
        let new = s.find_new(&candidates);
        assert_eq!(new, vec!["0xa".to_string(), "0xb".to_string()]);
        s.mark_complete(&new).unwrap();

        assert!(s.find_new(&candidates).is_empty());
        s.mark_complete(&[]).unwrap();
        assert!(s.is_known("0xa"));

        let mut restored = scheduler(store);
        restored.restore().unwrap();
        assert!(restored.is_known("0xa"));
        assert!(restored.is_known("0xb"));
        assert!(restored.last_discovery().is_some());
    }

    #[test]
    fn test_persist_failure_keeps_memory_state() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let mut s = scheduler(store);

        assert!(s.mark_complete(&["0xa".to_string()]).is_err());
        assert!(s.is_known("0xa"));
        assert!(s.last_discovery().is_some());
    }

    #[test]
    fn test_remember_does_not_count_as_sweep() {
        let store = Arc::new(MemoryStore::new());
        let mut s = scheduler(store.clone());

        assert_eq!(s.remember(&["0xa".to_string()]).unwrap(), 1);
        assert_eq!(s.remember(&["0xa".to_string()]).unwrap(), 0);
        assert!(s.last_discovery().is_none());

        let mut restored = scheduler(store);
        restored.restore().unwrap();
        assert!(restored.is_known("0xa"));
    }

    #[test]
    fn test_persist_merges_addresses_from_other_writers() {
        let store = Arc::new(MemoryStore::new());
        let mut monitor = scheduler(store.clone());
        monitor.restore().unwrap();

        let mut cli = scheduler(store.clone());
        cli.restore().unwrap();
        cli.remember(&["0xw".to_string()]).unwrap();

        monitor.mark_complete(&["0xn".to_string()]).unwrap();
        assert!(monitor.is_known("0xw"));

        let mut restored = scheduler(store);
        restored.restore().unwrap();
        assert!(restored.is_known("0xw"));
        assert!(restored.is_known("0xn"));
    }
}
