//! Per-phase results of a monitor cycle.

use chrono::{DateTime, Utc};

use crate::cache::{PriceUpdate, TierCounts};

/// Result of the scheduled refresh phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshOutcome {
    /// Keys selected by the scheduler
    pub due: usize,
    /// Distinct addresses fetched for those keys
    pub addresses: usize,
    /// Positions upserted from successful reads
    pub refreshed: usize,
    /// Positions first seen on an already-watched address
    pub admitted: Vec<String>,
    /// Positions the source no longer reports
    pub closed: Vec<String>,
    /// Addresses whose read failed or timed out
    pub failed: Vec<String>,
}

/// Result of a discovery sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryOutcome {
    pub candidates: usize,
    pub new_addresses: usize,
    pub scanned: usize,
    pub failed: usize,
    /// Keys added to the cache
    pub admitted: Vec<String>,
    /// First sweep ever; new-position alerts are not sent
    pub bootstrap: bool,
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub aged_out: Vec<String>,
    /// Scheduler records dropped for keys no longer cached
    pub forgotten: usize,
    pub counts: TierCounts,
    pub oldest_refresh: Option<DateTime<Utc>>,
    pub invariant_violation: Option<String>,
}

/// Everything one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// `None` when every price request failed and the update was skipped
    pub prices: Option<PriceUpdate>,
    pub refresh: RefreshOutcome,
    pub alerts_sent: usize,
    pub discovery: Option<DiscoveryOutcome>,
    pub maintenance: Option<MaintenanceReport>,
}
