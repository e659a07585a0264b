//! Configuration management for the liquidation monitor.
//!
//! Loads settings from an optional `config.toml`, then environment variables
//! prefixed `LIQMON__` (e.g. `LIQMON__MONITOR__CRITICAL_PCT=0.1`).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::alert::AlertThresholds;
use crate::position::TierThresholds;
use crate::scheduler::{DiscoverySettings, TierIntervals};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tier thresholds, alert bands and cycle pacing
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Discovery sweep cadence and candidate wallets
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Venue endpoint and exchanges to watch
    #[serde(default)]
    pub venue: VenueConfig,
    /// Alert delivery
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Durable store
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Distance (%) at or below which a position is in the critical tier
    #[serde(default = "default_critical_pct")]
    pub critical_pct: Decimal,
    /// Distance (%) at or below which a position is in the high tier
    #[serde(default = "default_high_pct")]
    pub high_pct: Decimal,
    /// Distance (%) that raises a proximity alert
    #[serde(default = "default_proximity_pct")]
    pub proximity_pct: Decimal,
    /// Distance (%) a position must exceed to count as recovered
    #[serde(default = "default_recovery_pct")]
    pub recovery_pct: Decimal,

    #[serde(default = "default_critical_interval_ms")]
    pub critical_interval_ms: u64,
    #[serde(default = "default_high_interval_secs")]
    pub high_interval_secs: u64,
    #[serde(default = "default_normal_interval_secs")]
    pub normal_interval_secs: u64,

    /// Upper bound on full refreshes per cycle
    #[serde(default = "default_max_refresh_per_cycle")]
    pub max_refresh_per_cycle: usize,
    /// Pause between cycles
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Minimum notional (USD) for a discovered position to be watched
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Discovered positions further than this (%) from liquidation are ignored
    #[serde(default = "default_max_watch_distance_pct")]
    pub max_watch_distance_pct: Decimal,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Snapshots older than this are discarded on startup
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: i64,
    #[serde(default = "default_max_interval_minutes")]
    pub max_interval_minutes: i64,
    /// Minutes the sweep interval grows by per critical position
    #[serde(default = "default_critical_weight")]
    pub critical_weight: i64,
    /// Minutes the sweep interval grows by per high position
    #[serde(default = "default_high_weight")]
    pub high_weight: i64,
    /// Candidate wallets
    #[serde(default)]
    pub addresses: Vec<String>,
    /// File with one candidate wallet per line
    #[serde(default)]
    pub addresses_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Exchanges to watch; the first one is the primary
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Concurrent position fetches during a refresh pass
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Minimum gap between two alerts of the same kind for one position
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_alert_on_new_positions")]
    pub alert_on_new_positions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

// Default value functions
fn default_critical_pct() -> Decimal {
    Decimal::new(125, 3) // 0.125%
}

fn default_high_pct() -> Decimal {
    Decimal::ONE // 1%
}

fn default_proximity_pct() -> Decimal {
    Decimal::new(25, 2) // 0.25%
}

fn default_recovery_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_critical_interval_ms() -> u64 {
    500
}

fn default_high_interval_secs() -> u64 {
    3
}

fn default_normal_interval_secs() -> u64 {
    30
}

fn default_max_refresh_per_cycle() -> usize {
    50
}

fn default_cycle_interval_ms() -> u64 {
    500
}

fn default_min_notional() -> Decimal {
    Decimal::new(50_000, 0) // $50k
}

fn default_max_watch_distance_pct() -> Decimal {
    Decimal::new(10, 0) // 10%
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

fn default_cache_max_age_secs() -> u64 {
    1800 // 30 minutes
}

fn default_min_interval_minutes() -> i64 {
    30
}

fn default_max_interval_minutes() -> i64 {
    240
}

fn default_critical_weight() -> i64 {
    15
}

fn default_high_weight() -> i64 {
    5
}

fn default_api_url() -> String {
    crate::sources::hyperliquid::MAINNET_API_URL.to_string()
}

fn default_exchanges() -> Vec<String> {
    vec![crate::sources::hyperliquid::MAIN_EXCHANGE.to_string()]
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_requests() -> usize {
    8
}

fn default_cooldown_seconds() -> i64 {
    300
}

fn default_alert_on_new_positions() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/liquidation_monitor.db")
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("LIQMON")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("venue.exchanges")
                    .with_list_parse_key("discovery.addresses")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        anyhow::ensure!(
            m.critical_pct > Decimal::ZERO && m.critical_pct < m.high_pct,
            "critical_pct must be positive and below high_pct"
        );
        anyhow::ensure!(
            m.critical_pct <= m.proximity_pct && m.proximity_pct < m.recovery_pct,
            "alert bands must satisfy critical_pct <= proximity_pct < recovery_pct"
        );
        anyhow::ensure!(
            m.critical_interval_ms > 0 && m.high_interval_secs > 0 && m.normal_interval_secs > 0,
            "tier refresh intervals must be positive"
        );
        anyhow::ensure!(m.max_refresh_per_cycle > 0, "max_refresh_per_cycle must be positive");
        anyhow::ensure!(m.cycle_interval_ms > 0, "cycle_interval_ms must be positive");
        anyhow::ensure!(m.min_notional >= Decimal::ZERO, "min_notional must not be negative");
        anyhow::ensure!(
            m.max_watch_distance_pct >= m.high_pct,
            "max_watch_distance_pct must be at least high_pct"
        );

        let d = &self.discovery;
        anyhow::ensure!(
            d.min_interval_minutes > 0 && d.min_interval_minutes <= d.max_interval_minutes,
            "discovery intervals must satisfy 0 < min <= max"
        );
        anyhow::ensure!(
            d.critical_weight >= 0 && d.high_weight >= 0,
            "discovery weights must not be negative"
        );

        anyhow::ensure!(!self.venue.exchanges.is_empty(), "at least one exchange is required");
        anyhow::ensure!(self.venue.max_concurrent_requests > 0, "max_concurrent_requests must be positive");
        anyhow::ensure!(self.venue.request_timeout_secs > 0, "request_timeout_secs must be positive");
        anyhow::ensure!(self.alerts.cooldown_seconds >= 0, "cooldown_seconds must not be negative");

        Ok(())
    }

    pub fn tier_thresholds(&self) -> TierThresholds {
        TierThresholds {
            critical_pct: self.monitor.critical_pct,
            high_pct: self.monitor.high_pct,
        }
    }

    pub fn alert_thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            proximity_pct: self.monitor.proximity_pct,
            critical_pct: self.monitor.critical_pct,
            recovery_pct: self.monitor.recovery_pct,
            cooldown: chrono::Duration::seconds(self.alerts.cooldown_seconds),
        }
    }

    pub fn tier_intervals(&self) -> TierIntervals {
        TierIntervals {
            critical: chrono::Duration::milliseconds(self.monitor.critical_interval_ms as i64),
            high: chrono::Duration::seconds(self.monitor.high_interval_secs as i64),
            normal: chrono::Duration::seconds(self.monitor.normal_interval_secs as i64),
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            min_interval_minutes: self.discovery.min_interval_minutes,
            max_interval_minutes: self.discovery.max_interval_minutes,
            critical_weight: self.discovery.critical_weight,
            high_weight: self.discovery.high_weight,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            critical_pct: default_critical_pct(),
            high_pct: default_high_pct(),
            proximity_pct: default_proximity_pct(),
            recovery_pct: default_recovery_pct(),
            critical_interval_ms: default_critical_interval_ms(),
            high_interval_secs: default_high_interval_secs(),
            normal_interval_secs: default_normal_interval_secs(),
            max_refresh_per_cycle: default_max_refresh_per_cycle(),
            cycle_interval_ms: default_cycle_interval_ms(),
            min_notional: default_min_notional(),
            max_watch_distance_pct: default_max_watch_distance_pct(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            cache_max_age_secs: default_cache_max_age_secs(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_interval_minutes: default_min_interval_minutes(),
            max_interval_minutes: default_max_interval_minutes(),
            critical_weight: default_critical_weight(),
            high_weight: default_high_weight(),
            addresses: Vec::new(),
            addresses_file: None,
        }
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            exchanges: default_exchanges(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            alert_on_new_positions: default_alert_on_new_positions(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_tier_thresholds_rejected() {
        let mut config = Config::default();
        config.monitor.critical_pct = dec!(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recovery_must_exceed_proximity() {
        let mut config = Config::default();
        config.monitor.recovery_pct = dec!(0.2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [monitor]
            critical_pct = "0.1"

            [venue]
            exchanges = ["hyperliquid", "xyz"]
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.monitor.critical_pct, dec!(0.1));
        assert_eq!(config.monitor.high_pct, dec!(1));
        assert_eq!(config.venue.exchanges, vec!["hyperliquid", "xyz"]);
        assert_eq!(config.discovery.max_interval_minutes, 240);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let config = Config::default();
        assert_eq!(config.tier_intervals().critical, chrono::Duration::milliseconds(500));
        assert_eq!(config.alert_thresholds().cooldown, chrono::Duration::seconds(300));
        assert_eq!(config.tier_thresholds().critical_pct, dec!(0.125));
        assert_eq!(config.discovery_settings().critical_weight, 15);
    }
}
