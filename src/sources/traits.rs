//! Venue-agnostic collaborator traits.
//!
//! The monitor only needs three things from the outside world: mark prices,
//! the open positions of a wallet, and a list of wallets worth watching.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

use crate::position::Position;

/// Errors raised by price, position and candidate sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies mark prices per exchange.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Mark prices keyed by bare token for one exchange.
    ///
    /// A token the venue does not quote is simply absent from the map.
    async fn mark_prices(&self, exchange: &str) -> Result<HashMap<String, Decimal>, SourceError>;
}

/// Reads the open positions of a wallet.
///
/// Must be idempotent and free of side effects on the venue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn fetch_positions(&self, address: &str, exchanges: &[String]) -> Result<Vec<Position>, SourceError>;
}

/// Supplies wallet addresses to consider during discovery.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(&self) -> Result<Vec<String>, SourceError>;
}
