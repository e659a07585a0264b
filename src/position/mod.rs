//! Position model and urgency-tier classification.
//!
//! A [`Position`] is the venue's view of a leveraged position. The cache wraps it
//! in a [`CachedPosition`], which carries the derived distance to liquidation,
//! the refresh tier and the alert bookkeeping for that position.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::alert::AlertState;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Margin mode of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Cross => "cross",
        }
    }
}

impl FromStr for MarginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "isolated" => Ok(MarginMode::Isolated),
            "cross" => Ok(MarginMode::Cross),
            other => Err(format!("unknown margin mode: {other}")),
        }
    }
}

/// A leveraged position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Wallet address (stored lowercase)
    pub address: String,
    /// Asset name without any exchange prefix (e.g., "BTC")
    pub token: String,
    /// Exchange the position lives on (e.g., "hyperliquid")
    pub exchange: String,
    pub side: Side,
    /// Absolute position size in base units
    pub size: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    /// `None` means the position cannot be liquidated
    pub liquidation_price: Option<Decimal>,
    /// Notional value in USD
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub margin_used: Decimal,
}

impl Position {
    /// Stable identifier for this position.
    pub fn key(&self) -> String {
        position_key(&self.address, &self.exchange, &self.token, self.side)
    }

    /// Signed distance from mark price to liquidation price, in percent.
    pub fn distance_pct(&self) -> Option<Decimal> {
        liquidation_distance_pct(self.side, self.mark_price, self.liquidation_price)
    }
}

/// Build the composite key for a position.
///
/// Address and exchange are lowercased so the same position always maps to the
/// same key regardless of how the source spells them.
pub fn position_key(address: &str, exchange: &str, token: &str, side: Side) -> String {
    format!(
        "{}:{}:{}:{}",
        address.to_ascii_lowercase(),
        exchange.to_ascii_lowercase(),
        token,
        side.as_str()
    )
}

/// Percentage distance to liquidation, positive while the position is safe.
///
/// Long: `(mark - liq) / mark * 100`, short: `(liq - mark) / mark * 100`.
/// Negative values mean the mark price is already past the liquidation price.
pub fn liquidation_distance_pct(
    side: Side,
    mark_price: Decimal,
    liquidation_price: Option<Decimal>,
) -> Option<Decimal> {
    let liq = liquidation_price?;
    if mark_price <= Decimal::ZERO || liq <= Decimal::ZERO {
        return None;
    }

    let gap = match side {
        Side::Long => mark_price - liq,
        Side::Short => liq - mark_price,
    };
    Some(gap / mark_price * dec!(100))
}

/// Urgency bucket governing how often a position is re-fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefreshTier {
    Critical,
    High,
    Normal,
}

impl RefreshTier {
    /// Tiers in scheduling priority order.
    pub const ALL: [RefreshTier; 3] = [RefreshTier::Critical, RefreshTier::High, RefreshTier::Normal];

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTier::Critical => "critical",
            RefreshTier::High => "high",
            RefreshTier::Normal => "normal",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            RefreshTier::Critical => 0,
            RefreshTier::High => 1,
            RefreshTier::Normal => 2,
        }
    }
}

impl fmt::Display for RefreshTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(RefreshTier::Critical),
            "high" => Ok(RefreshTier::High),
            "normal" => Ok(RefreshTier::Normal),
            other => Err(format!("unknown refresh tier: {other}")),
        }
    }
}

/// Classify a distance into a refresh tier.
///
/// Positions without a distance (no liquidation price) are always `Normal`.
pub fn classify(distance_pct: Option<Decimal>, critical_pct: Decimal, high_pct: Decimal) -> RefreshTier {
    match distance_pct {
        None => RefreshTier::Normal,
        Some(d) if d <= critical_pct => RefreshTier::Critical,
        Some(d) if d <= high_pct => RefreshTier::High,
        Some(_) => RefreshTier::Normal,
    }
}

/// Tier boundaries, `critical_pct < high_pct`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub critical_pct: Decimal,
    pub high_pct: Decimal,
}

impl TierThresholds {
    pub fn classify(&self, distance_pct: Option<Decimal>) -> RefreshTier {
        classify(distance_pct, self.critical_pct, self.high_pct)
    }
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            critical_pct: dec!(0.125),
            high_pct: dec!(1.0),
        }
    }
}

/// A monitored position together with its derived and bookkeeping fields.
///
/// Only [`crate::cache::PositionCache`] mutates these; everything else works on
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedPosition {
    pub key: String,
    pub position: Position,
    pub distance_pct: Option<Decimal>,
    pub refresh_tier: RefreshTier,
    pub last_full_refresh: DateTime<Utc>,
    pub last_price_update: DateTime<Utc>,
    pub alert: AlertState,
    /// Opaque id returned by the alert sink, used to link follow-up alerts
    pub alert_message_id: Option<String>,
}

impl CachedPosition {
    /// Wrap a freshly fetched position.
    pub fn new(position: Position, thresholds: &TierThresholds, now: DateTime<Utc>) -> Self {
        let distance_pct = position.distance_pct();
        Self {
            key: position.key(),
            refresh_tier: thresholds.classify(distance_pct),
            distance_pct,
            position,
            last_full_refresh: now,
            last_price_update: now,
            alert: AlertState::default(),
            alert_message_id: None,
        }
    }

    /// Recompute distance and tier from the current prices.
    pub(crate) fn reclassify(&mut self, thresholds: &TierThresholds) {
        self.distance_pct = self.position.distance_pct();
        self.refresh_tier = thresholds.classify(self.distance_pct);
    }

    /// Most recent time anything about this position was observed.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_full_refresh.max(self.last_price_update)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_position(address: &str, token: &str, side: Side, mark: Decimal, liq: Option<Decimal>) -> Position {
        Position {
            address: address.to_string(),
            token: token.to_string(),
            exchange: "hyperliquid".to_string(),
            side,
            size: dec!(10),
            leverage: 20,
            margin_mode: MarginMode::Cross,
            entry_price: mark,
            mark_price: mark,
            liquidation_price: liq,
            position_value: mark * dec!(10),
            unrealized_pnl: Decimal::ZERO,
            margin_used: mark * dec!(10) / dec!(20),
        }
    }

    #[test]
    fn test_classify_boundaries() {
        let critical = dec!(0.125);
        let high = dec!(1.0);

        assert_eq!(classify(None, critical, high), RefreshTier::Normal);
        assert_eq!(classify(Some(dec!(-2)), critical, high), RefreshTier::Critical);
        assert_eq!(classify(Some(dec!(0.125)), critical, high), RefreshTier::Critical);
        assert_eq!(classify(Some(dec!(0.126)), critical, high), RefreshTier::High);
        assert_eq!(classify(Some(dec!(1.0)), critical, high), RefreshTier::High);
        assert_eq!(classify(Some(dec!(1.01)), critical, high), RefreshTier::Normal);
    }

    #[test]
    fn test_distance_is_direction_adjusted() {
        // Long at 100 with liquidation at 90: 10% of room
        assert_eq!(
            liquidation_distance_pct(Side::Long, dec!(100), Some(dec!(90))),
            Some(dec!(10))
        );
        // Short at 100 with liquidation at 105: 5% of room
        assert_eq!(
            liquidation_distance_pct(Side::Short, dec!(100), Some(dec!(105))),
            Some(dec!(5))
        );
        // Short already past liquidation
        assert_eq!(
            liquidation_distance_pct(Side::Short, dec!(110), Some(dec!(105))).map(|d| d.is_sign_negative()),
            Some(true)
        );
        assert_eq!(liquidation_distance_pct(Side::Long, dec!(100), None), None);
        assert_eq!(liquidation_distance_pct(Side::Long, Decimal::ZERO, Some(dec!(90))), None);
    }

    #[test]
    fn test_position_key_is_stable_and_distinct() {
        let long = sample_position("0xABC", "ETH", Side::Long, dec!(3000), Some(dec!(2800)));
        let mut refreshed = long.clone();
        refreshed.mark_price = dec!(3100);
        refreshed.size = dec!(12);
        assert_eq!(long.key(), refreshed.key());
        assert_eq!(long.key(), "0xabc:hyperliquid:ETH:long");

        let mut short = long.clone();
        short.side = Side::Short;
        assert_ne!(long.key(), short.key());

        let mut other_exchange = long.clone();
        other_exchange.exchange = "xyz".to_string();
        assert_ne!(long.key(), other_exchange.key());
    }

    #[test]
    fn test_cached_position_tier_matches_distance() {
        let thresholds = TierThresholds::default();
        let pos = sample_position("0xabc", "BTC", Side::Long, dec!(100), Some(dec!(99.5)));
        let cached = CachedPosition::new(pos, &thresholds, Utc::now());

        assert_eq!(cached.distance_pct, Some(dec!(0.5)));
        assert_eq!(cached.refresh_tier, RefreshTier::High);
    }
}
