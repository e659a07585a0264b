//! Tier membership index.
//!
//! Every key lives in exactly one tier set, ordered by ascending distance so
//! the most urgent positions come first. All membership changes go through
//! [`TierIndex::file`] and [`TierIndex::unfile`].

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::position::RefreshTier;

/// Sort key: known distances ascending, unknown distances last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Urgency(Option<Decimal>);

impl Ord for Urgency {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Urgency {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TierIndex {
    tiers: [BTreeSet<(Urgency, String)>; 3],
    membership: HashMap<String, (RefreshTier, Urgency)>,
}

impl TierIndex {
    /// Place `key` in `tier`, removing any previous membership first.
    pub(crate) fn file(&mut self, key: &str, tier: RefreshTier, distance_pct: Option<Decimal>) {
        let urgency = Urgency(distance_pct);
        if let Some((old_tier, old_urgency)) = self.membership.get(key).copied() {
            if old_tier == tier && old_urgency == urgency {
                return;
            }
            self.tiers[old_tier.index()].remove(&(old_urgency, key.to_string()));
        }

        self.tiers[tier.index()].insert((urgency, key.to_string()));
        self.membership.insert(key.to_string(), (tier, urgency));
    }

    /// Drop `key` from whichever tier holds it.
    pub(crate) fn unfile(&mut self, key: &str) -> Option<RefreshTier> {
        let (tier, urgency) = self.membership.remove(key)?;
        self.tiers[tier.index()].remove(&(urgency, key.to_string()));
        Some(tier)
    }

    pub(crate) fn tier_of(&self, key: &str) -> Option<RefreshTier> {
        self.membership.get(key).map(|(tier, _)| *tier)
    }

    /// Keys in `tier`, closest to liquidation first.
    pub(crate) fn keys(&self, tier: RefreshTier) -> impl Iterator<Item = &str> {
        self.tiers[tier.index()].iter().map(|(_, key)| key.as_str())
    }

    pub(crate) fn len(&self, tier: RefreshTier) -> usize {
        self.tiers[tier.index()].len()
    }

    pub(crate) fn clear(&mut self) {
        for set in &mut self.tiers {
            set.clear();
        }
        self.membership.clear();
    }

    /// Verify the tier sets partition exactly `expected` keys.
    pub(crate) fn check<'a>(&self, expected: impl ExactSizeIterator<Item = &'a String>) -> Result<(), String> {
        let expected_len = expected.len();
        let filed: usize = self.tiers.iter().map(BTreeSet::len).sum();
        if filed != self.membership.len() {
            return Err(format!(
                "tier sets hold {} entries but membership has {}",
                filed,
                self.membership.len()
            ));
        }
        if filed != expected_len {
            return Err(format!(
                "tier sets hold {} entries but cache has {}",
                filed, expected_len
            ));
        }
        for key in expected {
            let Some((tier, urgency)) = self.membership.get(key) else {
                return Err(format!("{key} missing from tier index"));
            };
            if !self.tiers[tier.index()].contains(&(*urgency, key.clone())) {
                return Err(format!("{key} not present in its {tier} set"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_keys_ordered_by_distance_unknown_last() {
        let mut index = TierIndex::default();
        index.file("far", RefreshTier::Normal, Some(dec!(8)));
        index.file("none", RefreshTier::Normal, None);
        index.file("near", RefreshTier::Normal, Some(dec!(2)));

        let keys: Vec<_> = index.keys(RefreshTier::Normal).collect();
        assert_eq!(keys, vec!["near", "far", "none"]);
    }

    #[test]
    fn test_refile_moves_between_tiers() {
        let mut index = TierIndex::default();
        index.file("a", RefreshTier::Normal, Some(dec!(5)));
        index.file("a", RefreshTier::Critical, Some(dec!(0.1)));

        assert_eq!(index.len(RefreshTier::Normal), 0);
        assert_eq!(index.len(RefreshTier::Critical), 1);
        assert_eq!(index.tier_of("a"), Some(RefreshTier::Critical));

        assert_eq!(index.unfile("a"), Some(RefreshTier::Critical));
        assert_eq!(index.len(RefreshTier::Critical), 0);
        assert_eq!(index.unfile("a"), None);
    }
}
