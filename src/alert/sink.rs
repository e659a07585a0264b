//! Alert delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::state::{AlertEventType, RecoveryKind};
use crate::position::{CachedPosition, RefreshTier};

/// Context delivered with every alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMetadata {
    pub distance_pct: Option<Decimal>,
    pub tier: RefreshTier,
    /// Set on recovery alerts only
    pub recovery: Option<RecoveryKind>,
    /// Message id of an earlier alert for the same position
    pub reply_to: Option<String>,
}

/// Destination for alert events.
///
/// Implementations must not feed back into scheduling or classification; the
/// monitor only keeps the returned message id for linking follow-ups.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(
        &self,
        event: AlertEventType,
        position: &CachedPosition,
        metadata: &AlertMetadata,
    ) -> anyhow::Result<Option<String>>;
}

#[derive(Serialize)]
struct AlertRecord<'a> {
    alert_id: &'a str,
    timestamp: DateTime<Utc>,
    event: AlertEventType,
    position_key: &'a str,
    address: &'a str,
    token: &'a str,
    exchange: &'a str,
    side: &'a str,
    mark_price: Decimal,
    liquidation_price: Option<Decimal>,
    position_value: Decimal,
    #[serde(flatten)]
    metadata: &'a AlertMetadata,
}

/// Emits alerts as structured JSON log lines on the `liquidation_alert` target.
#[derive(Debug, Default)]
pub struct LogAlertSink {
    sequence: AtomicU64,
}

impl LogAlertSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(
        &self,
        event: AlertEventType,
        position: &CachedPosition,
        metadata: &AlertMetadata,
    ) -> anyhow::Result<Option<String>> {
        let timestamp = Utc::now();
        let alert_id = format!(
            "liq-{}-{}",
            timestamp.timestamp(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );

        let record = AlertRecord {
            alert_id: &alert_id,
            timestamp,
            event,
            position_key: &position.key,
            address: &position.position.address,
            token: &position.position.token,
            exchange: &position.position.exchange,
            side: position.position.side.as_str(),
            mark_price: position.position.mark_price,
            liquidation_price: position.position.liquidation_price,
            position_value: position.position.position_value,
            metadata,
        };
        let json = serde_json::to_string(&record)?;

        match event {
            AlertEventType::NewPosition | AlertEventType::Recovery => {
                info!(target: "liquidation_alert", "LIQUIDATION_ALERT: {}", json)
            }
            AlertEventType::Proximity => warn!(target: "liquidation_alert", "LIQUIDATION_ALERT: {}", json),
            AlertEventType::Critical => error!(target: "liquidation_alert", "LIQUIDATION_ALERT: {}", json),
        }

        Ok(Some(alert_id))
    }
}

/// An alert captured by [`RecordingAlertSink`].
#[derive(Debug, Clone)]
pub struct SentAlert {
    pub event: AlertEventType,
    pub position_key: String,
    pub metadata: AlertMetadata,
}

/// Sink that records every alert in memory. Used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    sent: Arc<Mutex<Vec<SentAlert>>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All alerts delivered so far.
    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.lock().clone()
    }

    /// Alerts of one type delivered so far.
    pub fn sent_of(&self, event: AlertEventType) -> Vec<SentAlert> {
        self.sent
            .lock()
            .iter()
            .filter(|a| a.event == event)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(
        &self,
        event: AlertEventType,
        position: &CachedPosition,
        metadata: &AlertMetadata,
    ) -> anyhow::Result<Option<String>> {
        let mut sent = self.sent.lock();
        sent.push(SentAlert {
            event,
            position_key: position.key.clone(),
            metadata: metadata.clone(),
        });
        Ok(Some(format!("rec-{}", sent.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::sample_position;
    use crate::position::{Side, TierThresholds};
    use rust_decimal_macros::dec;

    fn cached() -> CachedPosition {
        let pos = sample_position("0xabc", "BTC", Side::Long, dec!(100), Some(dec!(99.9)));
        CachedPosition::new(pos, &TierThresholds::default(), Utc::now())
    }

    #[tokio::test]
    async fn test_log_sink_returns_unique_ids() {
        let sink = LogAlertSink::new();
        let pos = cached();
        let metadata = AlertMetadata {
            distance_pct: pos.distance_pct,
            tier: pos.refresh_tier,
            recovery: None,
            reply_to: None,
        };

        let first = sink.send(AlertEventType::Critical, &pos, &metadata).await.unwrap();
        let second = sink.send(AlertEventType::Critical, &pos, &metadata).await.unwrap();
        assert!(first.is_some());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_recording_sink_filters_by_type() {
        let sink = RecordingAlertSink::new();
        let pos = cached();
        let metadata = AlertMetadata {
            distance_pct: pos.distance_pct,
            tier: pos.refresh_tier,
            recovery: None,
            reply_to: None,
        };

        sink.send(AlertEventType::Proximity, &pos, &metadata).await.unwrap();
        sink.send(AlertEventType::Critical, &pos, &metadata).await.unwrap();

        assert_eq!(sink.sent().len(), 2);
        assert_eq!(sink.sent_of(AlertEventType::Critical).len(), 1);
        assert_eq!(sink.sent_of(AlertEventType::Critical)[0].position_key, pos.key);
    }
}
