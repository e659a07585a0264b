//! # Liquidation Monitor
//!
//! Continuous liquidation-proximity monitoring for leveraged perpetuals
//! positions, with tiered refresh cadence and edge-triggered alerts.
//!
//! ## Architecture
//!
//! - `position`: Position model, distance to liquidation, tier classification
//! - `cache`: Authoritative tiered position cache with write-through persistence
//! - `scheduler`: Tier refresh scheduling and adaptive discovery cadence
//! - `alert`: Per-position alert state machine and alert sinks
//! - `orchestrator`: The monitor control loop
//! - `sources`: Price, position and candidate sources (Hyperliquid, mock)
//! - `persistence`: SQLite and in-memory stores
//! - `config`: Configuration management and validation

pub mod alert;
pub mod cache;
pub mod config;
pub mod orchestrator;
pub mod persistence;
pub mod position;
pub mod scheduler;
pub mod sources;

pub use config::Config;
