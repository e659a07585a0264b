//! Liquidation-proximity alerting.
//!
//! - `state`: edge-triggered per-position alert state machine with hysteresis
//!   and cooldown
//! - `sink`: delivery of alert events (structured log, recording fake)

mod sink;
mod state;

pub use sink::{AlertMetadata, AlertSink, LogAlertSink, RecordingAlertSink, SentAlert};
pub use state::{
    AlertEventType, AlertState, AlertStateMachine, AlertThresholds, AlertTrigger,
    AlertZone, Evaluation, RecoveryKind,
};
