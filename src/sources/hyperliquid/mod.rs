//! Hyperliquid venue integration.
//!
//! Read-only access used by the monitor:
//! - Mark prices per exchange (`allMids`)
//! - Open positions per wallet (`clearinghouseState`)
//!
//! # Exchanges
//!
//! The main perpetuals dex is addressed as `"hyperliquid"`. Any other exchange
//! name is passed through as the `dex` parameter of a builder-deployed dex, whose
//! coins come back prefixed (`"xyz:TSLA"`); the prefix is stripped so tokens are
//! always bare names.

mod client;
mod types;

pub use client::{HyperliquidClient, MAINNET_API_URL, MAIN_EXCHANGE};
pub use types::*;
