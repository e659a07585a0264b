//! In-memory venue for tests and dry runs.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::position::Position;
use crate::sources::{PositionSource, PriceSource, SourceError};

/// Simulated venue state.
#[derive(Debug, Default)]
pub struct MockVenueState {
    /// exchange -> token -> mark price
    pub prices: HashMap<String, HashMap<String, Decimal>>,
    /// address -> open positions across all exchanges
    pub positions: HashMap<String, Vec<Position>>,
    /// Addresses whose position fetch fails
    pub failing_addresses: HashSet<String>,
    /// When set, every price request fails
    pub prices_unavailable: bool,
}

/// Mock venue implementing both price and position sources.
#[derive(Debug, Clone, Default)]
pub struct MockVenue {
    state: Arc<RwLock<MockVenueState>>,
    position_calls: Arc<AtomicU64>,
    price_calls: Arc<AtomicU64>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, exchange: &str, token: &str, price: Decimal) {
        let mut state = self.state.write().await;
        state
            .prices
            .entry(exchange.to_ascii_lowercase())
            .or_default()
            .insert(token.to_string(), price);
    }

    /// Replace every open position of `address`.
    pub async fn set_positions(&self, address: &str, positions: Vec<Position>) {
        let mut state = self.state.write().await;
        state.positions.insert(address.to_ascii_lowercase(), positions);
    }

    /// Close every position of `address`.
    pub async fn clear_positions(&self, address: &str) {
        let mut state = self.state.write().await;
        state.positions.remove(&address.to_ascii_lowercase());
    }

    pub async fn fail_address(&self, address: &str, failing: bool) {
        let mut state = self.state.write().await;
        let address = address.to_ascii_lowercase();
        if failing {
            state.failing_addresses.insert(address);
        } else {
            state.failing_addresses.remove(&address);
        }
    }

    pub async fn set_prices_unavailable(&self, unavailable: bool) {
        self.state.write().await.prices_unavailable = unavailable;
    }

    /// Number of position fetches served so far.
    pub fn position_calls(&self) -> u64 {
        self.position_calls.load(Ordering::SeqCst)
    }

    /// Number of price fetches served so far.
    pub fn price_calls(&self) -> u64 {
        self.price_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for MockVenue {
    async fn mark_prices(&self, exchange: &str) -> Result<HashMap<String, Decimal>, SourceError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;
        if state.prices_unavailable {
            return Err(SourceError::Unavailable("mock prices disabled".to_string()));
        }
        Ok(state
            .prices
            .get(&exchange.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PositionSource for MockVenue {
    async fn fetch_positions(&self, address: &str, exchanges: &[String]) -> Result<Vec<Position>, SourceError> {
        self.position_calls.fetch_add(1, Ordering::SeqCst);
        let address = address.to_ascii_lowercase();
        let state = self.state.read().await;

        if state.failing_addresses.contains(&address) {
            return Err(SourceError::Unavailable(format!("mock failure for {}", address)));
        }

        let positions: Vec<Position> = state
            .positions
            .get(&address)
            .map(|all| {
                all.iter()
                    .filter(|p| exchanges.iter().any(|e| e.eq_ignore_ascii_case(&p.exchange)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        debug!(address = %address, positions = positions.len(), "Mock positions served");
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::sample_position;
    use crate::position::Side;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_positions_filtered_by_exchange() {
        let venue = MockVenue::new();
        let mut other = sample_position("0xa", "TSLA", Side::Long, dec!(250), Some(dec!(200)));
        other.exchange = "xyz".to_string();
        venue
            .set_positions("0xA", vec![sample_position("0xa", "BTC", Side::Long, dec!(100), Some(dec!(90))), other])
            .await;

        let main = venue.fetch_positions("0xa", &["hyperliquid".to_string()]).await.unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].token, "BTC");

        let both = venue
            .fetch_positions("0xa", &["hyperliquid".to_string(), "xyz".to_string()])
            .await
            .unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(venue.position_calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let venue = MockVenue::new();
        venue.fail_address("0xb", true).await;
        assert!(venue.fetch_positions("0xb", &["hyperliquid".to_string()]).await.is_err());

        venue.fail_address("0xb", false).await;
        assert!(venue.fetch_positions("0xb", &["hyperliquid".to_string()]).await.unwrap().is_empty());

        venue.set_price("hyperliquid", "BTC", dec!(100)).await;
        assert_eq!(venue.mark_prices("hyperliquid").await.unwrap()["BTC"], dec!(100));
        venue.set_prices_unavailable(true).await;
        assert!(venue.mark_prices("hyperliquid").await.is_err());
    }
}
