//! Hyperliquid REST API client.
//!
//! Read-only access to the `POST /info` endpoint for mark prices and wallet
//! positions, on the main perpetuals exchange and on builder-deployed dexes.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

use super::types::*;
use crate::position::{MarginMode, Position, Side};
use crate::sources::{PositionSource, PriceSource, SourceError};

/// Base URL for Hyperliquid mainnet API.
pub const MAINNET_API_URL: &str = "https://api.hyperliquid.xyz";

/// Exchange name used for the main perpetuals dex.
pub const MAIN_EXCHANGE: &str = "hyperliquid";

/// Hyperliquid API client for prices and positions.
#[derive(Debug, Clone)]
pub struct HyperliquidClient {
    client: Client,
    base_url: String,
}

impl HyperliquidClient {
    /// Create a new Hyperliquid client for mainnet.
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        Self::with_base_url(MAINNET_API_URL, timeout)
    }

    /// Create a new Hyperliquid client with a custom base URL.
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn info<T: DeserializeOwned>(&self, request: &InfoRequest) -> Result<T, SourceError> {
        let url = format!("{}/info", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    /// Mid prices for one exchange, keyed by bare coin name.
    #[instrument(skip(self), name = "hl_all_mids")]
    pub async fn all_mids(&self, exchange: &str) -> Result<HashMap<String, Decimal>, SourceError> {
        let request = InfoRequest::AllMids { dex: dex_param(exchange) };
        let raw: HashMap<String, String> = self.info(&request).await?;

        let mids: HashMap<String, Decimal> = raw
            .into_iter()
            .filter_map(|(coin, px)| {
                let price = px.parse::<Decimal>().ok()?;
                Some((strip_dex_prefix(&coin).to_string(), price))
            })
            .collect();

        debug!(exchange, prices = mids.len(), "Fetched mid prices");
        Ok(mids)
    }

    /// Open positions of `address` on one exchange.
    #[instrument(skip(self), name = "hl_clearinghouse_state")]
    pub async fn clearinghouse_positions(&self, address: &str, exchange: &str) -> Result<Vec<Position>, SourceError> {
        let request = InfoRequest::ClearinghouseState {
            user: address.to_string(),
            dex: dex_param(exchange),
        };
        let state: ClearinghouseState = self.info(&request).await?;

        let positions: Vec<Position> = state
            .asset_positions
            .into_iter()
            .filter_map(|ap| convert_position(address, exchange, ap.position))
            .collect();

        debug!(address, exchange, positions = positions.len(), "Fetched positions");
        Ok(positions)
    }
}

#[async_trait]
impl PriceSource for HyperliquidClient {
    async fn mark_prices(&self, exchange: &str) -> Result<HashMap<String, Decimal>, SourceError> {
        self.all_mids(exchange).await
    }
}

#[async_trait]
impl PositionSource for HyperliquidClient {
    async fn fetch_positions(&self, address: &str, exchanges: &[String]) -> Result<Vec<Position>, SourceError> {
        let mut positions = Vec::new();
        for exchange in exchanges {
            positions.extend(self.clearinghouse_positions(address, exchange).await?);
        }
        Ok(positions)
    }
}

/// The main dex takes no `dex` parameter; every other exchange is a dex name.
fn dex_param(exchange: &str) -> Option<String> {
    if exchange.eq_ignore_ascii_case(MAIN_EXCHANGE) || exchange.is_empty() {
        None
    } else {
        Some(exchange.to_string())
    }
}

fn strip_dex_prefix(coin: &str) -> &str {
    coin.split_once(':').map_or(coin, |(_, name)| name)
}

fn convert_position(address: &str, exchange: &str, data: PositionData) -> Option<Position> {
    if data.szi.is_zero() {
        return None;
    }

    let size = data.szi.abs();
    let side = if data.szi.is_sign_positive() { Side::Long } else { Side::Short };
    let margin_mode = if data.leverage.kind.eq_ignore_ascii_case("isolated") {
        MarginMode::Isolated
    } else {
        MarginMode::Cross
    };
    let mark_price = data.position_value / size;

    Some(Position {
        address: address.to_ascii_lowercase(),
        token: strip_dex_prefix(&data.coin).to_string(),
        exchange: exchange.to_ascii_lowercase(),
        side,
        size,
        leverage: data.leverage.value,
        margin_mode,
        entry_price: data.entry_px.unwrap_or(mark_price),
        mark_price,
        liquidation_price: data.liquidation_px.filter(|p| *p > Decimal::ZERO),
        position_value: data.position_value,
        unrealized_pnl: data.unrealized_pnl,
        margin_used: data.margin_used,
    })
}
