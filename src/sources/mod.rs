//! Outside-world collaborators of the monitor.
//!
//! ## Hyperliquid
//! Read-only `POST /info` access for:
//! - Mark prices per exchange (`allMids`, including builder-deployed dexes)
//! - Wallet positions (`clearinghouseState`)
//!
//! ## Candidates
//! Static wallet lists from configuration or a file.
//!
//! ## Mock
//! In-memory venue for tests and dry runs.

mod candidates;
pub mod hyperliquid;
pub mod mock;
mod traits;

pub use candidates::StaticCandidates;
pub use hyperliquid::HyperliquidClient;
pub use mock::MockVenue;
pub use traits::{CandidateSource, PositionSource, PriceSource, SourceError};

#[cfg(test)]
pub use traits::MockPositionSource;
