//! Tiered position cache.
//!
//! The [`PositionCache`] is the single source of truth for monitored positions.
//! It owns the canonical [`CachedPosition`] records, keeps every key filed in
//! exactly one urgency tier, and writes each mutation through to the
//! [`PersistenceStore`] so the layout survives a restart.
//!
//! Write-through failures never roll back the in-memory change: the error is
//! returned to the caller and the cache stays authoritative until the next
//! successful write.

mod tiers;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alert::AlertState;
use crate::persistence::{PersistenceStore, StoreError};
use crate::position::{CachedPosition, Position, RefreshTier, TierThresholds};
use tiers::TierIndex;

/// Prices keyed by `"{exchange}:{token}"` or by bare token.
pub type PriceMap = HashMap<String, Decimal>;

/// Key used for an exchange-qualified price.
pub fn price_key(exchange: &str, token: &str) -> String {
    format!("{}:{}", exchange.to_ascii_lowercase(), token)
}

/// Number of positions per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
}

impl TierCounts {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal
    }
}

/// What happened when the cache was rebuilt from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Nothing persisted
    ColdStart,
    /// Snapshot accepted
    Loaded { count: usize },
    /// Snapshot older than the allowed age; discarded
    Stale { age: Duration, discarded: usize },
}

/// A position whose tier changed during a price update.
#[derive(Debug, Clone, PartialEq)]
pub struct TierChange {
    pub key: String,
    pub from: RefreshTier,
    pub to: RefreshTier,
}

/// Summary of one price update pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceUpdate {
    pub updated: usize,
    pub unresolved: usize,
    pub tier_changes: Vec<TierChange>,
}

/// Authoritative store of monitored positions, partitioned by refresh tier.
pub struct PositionCache {
    positions: HashMap<String, CachedPosition>,
    tiers: TierIndex,
    thresholds: TierThresholds,
    store: Arc<dyn PersistenceStore>,
}

impl PositionCache {
    pub fn new(thresholds: TierThresholds, store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            positions: HashMap::new(),
            tiers: TierIndex::default(),
            thresholds,
            store,
        }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    /// Rebuild from the persistence store.
    pub fn load_from_store(&mut self, max_age: Duration, now: DateTime<Utc>) -> Result<LoadOutcome, StoreError> {
        let persisted = self.store.load_all()?;
        self.load(persisted, max_age, now)
    }

    /// Rebuild in-memory state from a snapshot.
    ///
    /// Tiers are recomputed from each position's prices, never trusted from the
    /// snapshot. A snapshot whose newest entry is older than `max_age` is
    /// rejected and its rows deleted from the store.
    pub fn load(
        &mut self,
        persisted: Vec<CachedPosition>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<LoadOutcome, StoreError> {
        self.positions.clear();
        self.tiers.clear();

        let Some(newest) = persisted.iter().map(CachedPosition::last_seen).max() else {
            info!("No persisted positions, cold start");
            return Ok(LoadOutcome::ColdStart);
        };

        let age = now - newest;
        if age > max_age {
            let keys: Vec<String> = persisted.into_iter().map(|p| p.key).collect();
            warn!(
                age_secs = age.num_seconds(),
                max_age_secs = max_age.num_seconds(),
                positions = keys.len(),
                "Persisted cache is stale, discarding"
            );
            self.store.delete(&keys)?;
            return Ok(LoadOutcome::Stale {
                age,
                discarded: keys.len(),
            });
        }

        for mut pos in persisted {
            pos.key = pos.position.key();
            pos.reclassify(&self.thresholds);
            self.tiers.file(&pos.key, pos.refresh_tier, pos.distance_pct);
            self.positions.insert(pos.key.clone(), pos);
        }

        let counts = self.tier_counts();
        info!(
            positions = self.positions.len(),
            critical = counts.critical,
            high = counts.high,
            normal = counts.normal,
            "Restored position cache"
        );
        Ok(LoadOutcome::Loaded {
            count: self.positions.len(),
        })
    }

    /// Apply fresh mark prices to every cached position.
    ///
    /// Prices resolve by `"{exchange}:{token}"` first, then bare token.
    /// Positions without a resolvable price keep their previous state.
    pub fn update_prices(&mut self, prices: &PriceMap, now: DateTime<Utc>) -> Result<PriceUpdate, StoreError> {
        let mut summary = PriceUpdate::default();
        let mut dirty = Vec::new();

        for pos in self.positions.values_mut() {
            let price = prices
                .get(&price_key(&pos.position.exchange, &pos.position.token))
                .or_else(|| prices.get(&pos.position.token))
                .copied()
                .filter(|p| *p > Decimal::ZERO);

            let Some(price) = price else {
                summary.unresolved += 1;
                continue;
            };

            let previous_tier = pos.refresh_tier;
            pos.position.mark_price = price;
            pos.position.position_value = pos.position.size.abs() * price;
            pos.last_price_update = pos.last_price_update.max(now);
            pos.reclassify(&self.thresholds);
            self.tiers.file(&pos.key, pos.refresh_tier, pos.distance_pct);

            if previous_tier != pos.refresh_tier {
                debug!(
                    key = %pos.key,
                    from = %previous_tier,
                    to = %pos.refresh_tier,
                    distance_pct = ?pos.distance_pct,
                    "Position changed tier"
                );
                summary.tier_changes.push(TierChange {
                    key: pos.key.clone(),
                    from: previous_tier,
                    to: pos.refresh_tier,
                });
            }

            summary.updated += 1;
            dirty.push(pos.clone());
        }

        self.store.save_batch(&dirty)?;
        Ok(summary)
    }

    /// Insert or refresh a position from a full read.
    ///
    /// Alert bookkeeping survives the upsert. Returns `true` when the key was new.
    pub fn update_position(
        &mut self,
        position: Position,
        now: DateTime<Utc>,
        persist: bool,
    ) -> Result<bool, StoreError> {
        let (inserted, snapshot) = self.apply(position, now);
        if persist {
            self.store.save(&snapshot)?;
        }
        Ok(inserted)
    }

    /// Upsert many positions with a single store write. Returns the number inserted.
    pub fn update_batch(&mut self, positions: Vec<Position>, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inserted = 0;
        let mut snapshots = Vec::with_capacity(positions.len());
        for position in positions {
            let (is_new, snapshot) = self.apply(position, now);
            inserted += usize::from(is_new);
            snapshots.push(snapshot);
        }
        self.store.save_batch(&snapshots)?;
        Ok(inserted)
    }

    fn apply(&mut self, position: Position, now: DateTime<Utc>) -> (bool, CachedPosition) {
        let key = position.key();
        let inserted = match self.positions.get_mut(&key) {
            Some(existing) => {
                existing.position = position;
                existing.last_full_refresh = existing.last_full_refresh.max(now);
                existing.last_price_update = existing.last_price_update.max(now);
                existing.reclassify(&self.thresholds);
                false
            }
            None => {
                let cached = CachedPosition::new(position, &self.thresholds, now);
                self.positions.insert(key.clone(), cached);
                true
            }
        };

        let entry = &self.positions[&key];
        self.tiers.file(&key, entry.refresh_tier, entry.distance_pct);
        (inserted, entry.clone())
    }

    /// Remove one position.
    pub fn remove(&mut self, key: &str) -> Result<Option<CachedPosition>, StoreError> {
        let removed = self.detach(key);
        if removed.is_some() {
            self.store.delete(&[key.to_string()])?;
        }
        Ok(removed)
    }

    /// Remove several positions with a single store write.
    pub fn remove_many(&mut self, keys: &[String]) -> Result<Vec<CachedPosition>, StoreError> {
        let removed: Vec<CachedPosition> = keys.iter().filter_map(|k| self.detach(k)).collect();
        let removed_keys: Vec<String> = removed.iter().map(|p| p.key.clone()).collect();
        self.store.delete(&removed_keys)?;
        Ok(removed)
    }

    /// Remove positions of `addresses` that are missing from `live_keys`.
    ///
    /// Used after a full read of those addresses: anything the source no longer
    /// reports has been closed. Returns the removed keys.
    pub fn remove_not_in(
        &mut self,
        live_keys: &HashSet<String>,
        addresses: &HashSet<String>,
    ) -> Result<Vec<String>, StoreError> {
        let closed: Vec<String> = self
            .positions
            .values()
            .filter(|p| addresses.contains(&p.position.address) && !live_keys.contains(&p.key))
            .map(|p| p.key.clone())
            .collect();

        if closed.is_empty() {
            return Ok(closed);
        }

        for key in &closed {
            self.detach(key);
            info!(key = %key, "Position closed, removed from monitoring");
        }
        self.store.delete(&closed)?;
        Ok(closed)
    }

    fn detach(&mut self, key: &str) -> Option<CachedPosition> {
        let removed = self.positions.remove(key)?;
        self.tiers.unfile(key);
        Some(removed)
    }

    /// Replace the alert bookkeeping of a position.
    pub fn set_alert_state(&mut self, key: &str, alert: AlertState) -> Result<(), StoreError> {
        let Some(pos) = self.positions.get_mut(key) else {
            return Ok(());
        };
        if pos.alert == alert {
            return Ok(());
        }
        pos.alert = alert;
        self.store.save(pos)
    }

    /// Remember the sink's message id for linking follow-up alerts.
    pub fn set_alert_message_id(&mut self, key: &str, message_id: Option<String>) -> Result<(), StoreError> {
        let Some(pos) = self.positions.get_mut(key) else {
            return Ok(());
        };
        pos.alert_message_id = message_id;
        self.store.save(pos)
    }

    /// Record a full read of `key` without changing its data.
    ///
    /// Timestamps never move backward.
    pub fn mark_full_refresh(&mut self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(pos) = self.positions.get_mut(key) else {
            return Ok(());
        };
        if at <= pos.last_full_refresh {
            return Ok(());
        }
        pos.last_full_refresh = at;
        self.store.save(pos)
    }

    pub fn get(&self, key: &str) -> Option<&CachedPosition> {
        self.positions.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.positions.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedPosition> {
        self.positions.values()
    }

    /// Addresses with at least one cached position.
    pub fn addresses(&self) -> HashSet<String> {
        self.positions
            .values()
            .map(|p| p.position.address.clone())
            .collect()
    }

    pub fn tier_counts(&self) -> TierCounts {
        TierCounts {
            critical: self.tiers.len(RefreshTier::Critical),
            high: self.tiers.len(RefreshTier::High),
            normal: self.tiers.len(RefreshTier::Normal),
        }
    }

    /// Positions in `tier`, closest to liquidation first.
    pub fn by_tier(&self, tier: RefreshTier) -> Vec<&CachedPosition> {
        self.tiers
            .keys(tier)
            .filter_map(|key| self.positions.get(key))
            .collect()
    }

    /// Keys in `tier`, closest to liquidation first.
    pub fn keys_by_tier(&self, tier: RefreshTier) -> impl Iterator<Item = &str> {
        self.tiers.keys(tier)
    }

    /// Oldest full refresh across all positions.
    pub fn oldest_refresh(&self) -> Option<DateTime<Utc>> {
        self.positions.values().map(|p| p.last_full_refresh).min()
    }

    /// Verify that tiers partition the key set and agree with classification.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.tiers.check(self.positions.keys())?;
        for pos in self.positions.values() {
            let expected = self.thresholds.classify(pos.distance_pct);
            if pos.refresh_tier != expected {
                return Err(format!(
                    "{} has tier {} but distance {:?} classifies as {}",
                    pos.key, pos.refresh_tier, pos.distance_pct, expected
                ));
            }
            if self.tiers.tier_of(&pos.key) != Some(pos.refresh_tier) {
                return Err(format!("{} filed under the wrong tier", pos.key));
            }
        }
        Ok(())
    }
}
