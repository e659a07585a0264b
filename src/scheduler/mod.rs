//! Scheduling of outbound requests.
//!
//! - `refresh`: picks which cached positions get a full re-read each cycle,
//!   by tier priority and per-tier cadence
//! - `discovery`: decides when to sweep for new wallets, backing off while the
//!   urgent tiers are busy

mod discovery;
mod refresh;

pub use discovery::{DiscoveryScheduler, DiscoverySettings};
pub use refresh::{TierIntervals, TieredRefreshScheduler};
