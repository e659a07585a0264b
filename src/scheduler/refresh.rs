//! Tier-priority refresh scheduling.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::cache::PositionCache;
use crate::position::RefreshTier;

/// Minimum time between full refreshes, per tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierIntervals {
    pub critical: Duration,
    pub high: Duration,
    pub normal: Duration,
}

impl TierIntervals {
    pub fn for_tier(&self, tier: RefreshTier) -> Duration {
        match tier {
            RefreshTier::Critical => self.critical,
            RefreshTier::High => self.high,
            RefreshTier::Normal => self.normal,
        }
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            critical: Duration::milliseconds(500),
            high: Duration::seconds(3),
            normal: Duration::seconds(30),
        }
    }
}

/// Selects due positions over the cache's tier index.
///
/// Holds only refresh timestamps; position data stays in the cache.
#[derive(Debug, Default)]
pub struct TieredRefreshScheduler {
    intervals: TierIntervals,
    last_refresh: HashMap<String, DateTime<Utc>>,
}

impl TieredRefreshScheduler {
    pub fn new(intervals: TierIntervals) -> Self {
        Self {
            intervals,
            last_refresh: HashMap::new(),
        }
    }

    pub fn intervals(&self) -> &TierIntervals {
        &self.intervals
    }

    pub fn get_due(&self, cache: &PositionCache, max_count: usize) -> Vec<String> {
        self.get_due_at(cache, max_count, Utc::now())
    }

    /// Up to `max_count` keys due for a refresh, most urgent first.
    ///
    /// Tiers are scanned Critical, High, Normal and each tier closest to
    /// liquidation first, so a flood of due Normal positions can never push
    /// out a due Critical one.
    pub fn get_due_at(&self, cache: &PositionCache, max_count: usize, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        if max_count == 0 {
            return due;
        }

        for tier in RefreshTier::ALL {
            let interval = self.intervals.for_tier(tier);
            for key in cache.keys_by_tier(tier) {
                let last = self
                    .last_refresh
                    .get(key)
                    .copied()
                    .or_else(|| cache.get(key).map(|p| p.last_full_refresh));

                let is_due = match last {
                    Some(at) => now - at >= interval,
                    None => true,
                };
                if is_due {
                    due.push(key.to_string());
                    if due.len() >= max_count {
                        return due;
                    }
                }
            }
        }
        due
    }

    pub fn mark_refreshed(&mut self, key: &str) {
        self.mark_refreshed_at(key, Utc::now());
    }

    pub fn mark_refreshed_at(&mut self, key: &str, now: DateTime<Utc>) {
        let entry = self.last_refresh.entry(key.to_string()).or_insert(now);
        *entry = (*entry).max(now);
    }

    pub fn mark_all_refreshed_at<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>, now: DateTime<Utc>) {
        for key in keys {
            self.mark_refreshed_at(key, now);
        }
    }

    pub fn last_refresh(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_refresh.get(key).copied()
    }

    /// Drop bookkeeping for removed keys.
    pub fn forget<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            self.last_refresh.remove(key);
        }
    }

    /// Drop bookkeeping for keys the cache no longer holds.
    pub fn retain_cached(&mut self, cache: &PositionCache) -> usize {
        let before = self.last_refresh.len();
        self.last_refresh.retain(|key, _| cache.contains(key));
        before - self.last_refresh.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::position::tests::sample_position;
    use crate::position::{Side, TierThresholds};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn cache() -> PositionCache {
        PositionCache::new(TierThresholds::default(), Arc::new(MemoryStore::new()))
    }

    fn intervals() -> TierIntervals {
        TierIntervals {
            critical: Duration::seconds(1),
            high: Duration::seconds(5),
            normal: Duration::seconds(30),
        }
    }

    #[test]
    fn test_critical_beats_normal_flood() {
        let mut cache = cache();
        let then = Utc::now() - Duration::minutes(10);
        for i in 0..10 {
            let addr = format!("0x{i:02}");
            cache
                .update_position(sample_position(&addr, "BTC", Side::Long, dec!(100), Some(dec!(80))), then, true)
                .unwrap();
        }
        let critical = sample_position("0xcc", "ETH", Side::Long, dec!(100), Some(dec!(99.95)));
        cache.update_position(critical.clone(), then, true).unwrap();

        let scheduler = TieredRefreshScheduler::new(intervals());
        let due = scheduler.get_due_at(&cache, 1, Utc::now());

        assert_eq!(due, vec![critical.key()]);
    }

    #[test]
    fn test_respects_tier_cadence() {
        let mut cache = cache();
        let now = Utc::now();
        let critical = sample_position("0xa", "BTC", Side::Long, dec!(100), Some(dec!(99.95)));
        let normal = sample_position("0xb", "BTC", Side::Long, dec!(100), Some(dec!(80)));
        cache.update_batch(vec![critical.clone(), normal.clone()], now).unwrap();

        let mut scheduler = TieredRefreshScheduler::new(intervals());
        scheduler.mark_all_refreshed_at([critical.key(), normal.key()].iter(), now);

        assert!(scheduler.get_due_at(&cache, 10, now).is_empty());
        assert_eq!(
            scheduler.get_due_at(&cache, 10, now + Duration::seconds(2)),
            vec![critical.key()]
        );
        assert_eq!(
            scheduler.get_due_at(&cache, 10, now + Duration::seconds(31)),
            vec![critical.key(), normal.key()]
        );
    }

    #[test]
    fn test_falls_back_to_cache_refresh_time() {
        let mut cache = cache();
        let now = Utc::now();
        let normal = sample_position("0xb", "BTC", Side::Long, dec!(100), Some(dec!(80)));
        cache.update_position(normal.clone(), now, true).unwrap();

        let scheduler = TieredRefreshScheduler::new(intervals());
        assert!(scheduler.get_due_at(&cache, 10, now + Duration::seconds(10)).is_empty());
        assert_eq!(scheduler.get_due_at(&cache, 10, now + Duration::seconds(30)).len(), 1);
    }

    #[test]
    fn test_mark_refreshed_never_moves_backward() {
        let mut scheduler = TieredRefreshScheduler::new(intervals());
        let now = Utc::now();
        scheduler.mark_refreshed_at("k", now);
        scheduler.mark_refreshed_at("k", now - Duration::seconds(10));
        assert_eq!(scheduler.last_refresh("k"), Some(now));
    }

    #[test]
    fn test_retain_drops_removed_keys() {
        let mut cache = cache();
        let now = Utc::now();
        let pos = sample_position("0xa", "BTC", Side::Long, dec!(100), Some(dec!(80)));
        cache.update_position(pos.clone(), now, true).unwrap();

        let mut scheduler = TieredRefreshScheduler::new(intervals());
        scheduler.mark_refreshed_at(&pos.key(), now);
        scheduler.mark_refreshed_at("gone", now);

        assert_eq!(scheduler.retain_cached(&cache), 1);
        assert!(scheduler.last_refresh(&pos.key()).is_some());
    }
}
