//! Per-position alert state machine.
//!
//! Converts a stream of distance samples into the smallest useful sequence of
//! alerts. Zones only move on threshold crossings, recovery requires clearing a
//! higher bar than the one that raised the alert, and a cooldown suppresses
//! repeats of the same alert type for a position.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Kinds of alert events delivered to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertEventType {
    NewPosition,
    Proximity,
    Critical,
    Recovery,
}

impl AlertEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEventType::NewPosition => "new_position",
            AlertEventType::Proximity => "proximity",
            AlertEventType::Critical => "critical",
            AlertEventType::Recovery => "recovery",
        }
    }
}

impl fmt::Display for AlertEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_position" => Ok(AlertEventType::NewPosition),
            "proximity" => Ok(AlertEventType::Proximity),
            "critical" => Ok(AlertEventType::Critical),
            "recovery" => Ok(AlertEventType::Recovery),
            other => Err(format!("unknown alert event type: {other}")),
        }
    }
}

/// Logical alert zone of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AlertZone {
    #[default]
    Normal,
    Proximity,
    Critical,
}

impl AlertZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertZone::Normal => "normal",
            AlertZone::Proximity => "proximity",
            AlertZone::Critical => "critical",
        }
    }
}

impl FromStr for AlertZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(AlertZone::Normal),
            "proximity" => Ok(AlertZone::Proximity),
            "critical" => Ok(AlertZone::Critical),
            other => Err(format!("unknown alert zone: {other}")),
        }
    }
}

/// Alert bookkeeping for one position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertState {
    pub zone: AlertZone,
    /// When each alert type was last delivered, for the cooldown
    #[serde(default)]
    pub last_alerts: BTreeMap<AlertEventType, DateTime<Utc>>,
    /// Liquidation price when the position entered the critical zone
    pub critical_entry_liquidation_price: Option<Decimal>,
}

impl AlertState {
    /// Most recently delivered alert, if any.
    pub fn last_alert(&self) -> Option<(AlertEventType, DateTime<Utc>)> {
        self.last_alerts
            .iter()
            .max_by_key(|(_, at)| **at)
            .map(|(kind, at)| (*kind, *at))
    }

    /// Record a delivered alert outside the state machine (new-position notices).
    pub fn record_alert(&mut self, kind: AlertEventType, at: DateTime<Utc>) {
        self.last_alerts.insert(kind, at);
    }
}

/// How a position left the alert zones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum RecoveryKind {
    /// Liquidation price moved since critical entry: margin was added or size reduced
    LiquidationPriceMoved { from: Decimal, to: Decimal },
    /// Only the mark price moved away; the position is as fragile as before
    PriceRetracement,
    /// The venue no longer reports a liquidation price at all
    LiquidationRemoved { from: Option<Decimal> },
    /// No critical-entry reference to compare against
    Unconfirmed,
}

/// Thresholds driving the state machine.
///
/// Must satisfy `critical_pct <= proximity_pct < recovery_pct`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub proximity_pct: Decimal,
    pub critical_pct: Decimal,
    pub recovery_pct: Decimal,
    pub cooldown: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            proximity_pct: dec!(0.25),
            critical_pct: dec!(0.125),
            recovery_pct: dec!(0.5),
            cooldown: Duration::seconds(300),
        }
    }
}

/// An alert the state machine wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTrigger {
    pub kind: AlertEventType,
    /// `None` when the position stopped having a liquidation price
    pub distance_pct: Option<Decimal>,
    pub recovery: Option<RecoveryKind>,
}

/// Result of feeding one sample to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: AlertState,
    pub trigger: Option<AlertTrigger>,
}

/// Stateless evaluator; the per-position state lives on the cached position.
#[derive(Debug, Clone)]
pub struct AlertStateMachine {
    thresholds: AlertThresholds,
}

impl AlertStateMachine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Feed a distance sample for a position.
    ///
    /// Returns the next state and, when a zone edge was crossed outside the
    /// cooldown window, the alert to deliver. A sample without a distance
    /// recovers an alerted position whose liquidation price is gone and
    /// otherwise leaves the state unchanged.
    pub fn evaluate(
        &self,
        state: &AlertState,
        distance_pct: Option<Decimal>,
        liquidation_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let Some(distance) = distance_pct else {
            if liquidation_price.is_none() && state.zone != AlertZone::Normal {
                let next = AlertState {
                    zone: AlertZone::Normal,
                    critical_entry_liquidation_price: None,
                    ..state.clone()
                };
                let recovery = RecoveryKind::LiquidationRemoved {
                    from: state.critical_entry_liquidation_price,
                };
                return self.deliver(state, next, AlertEventType::Recovery, None, Some(recovery), now);
            }
            return Evaluation {
                state: state.clone(),
                trigger: None,
            };
        };

        let t = &self.thresholds;
        let (zone, edge) = match state.zone {
            AlertZone::Normal if distance <= t.critical_pct => {
                (AlertZone::Critical, Some(AlertEventType::Critical))
            }
            AlertZone::Normal if distance <= t.proximity_pct => {
                (AlertZone::Proximity, Some(AlertEventType::Proximity))
            }
            AlertZone::Proximity if distance <= t.critical_pct => {
                (AlertZone::Critical, Some(AlertEventType::Critical))
            }
            AlertZone::Proximity | AlertZone::Critical if distance > t.recovery_pct => {
                (AlertZone::Normal, Some(AlertEventType::Recovery))
            }
            current => (current, None),
        };

        let mut next = AlertState {
            zone,
            ..state.clone()
        };

        let recovery = match edge {
            Some(AlertEventType::Critical) => {
                next.critical_entry_liquidation_price = liquidation_price;
                None
            }
            Some(AlertEventType::Recovery) => {
                next.critical_entry_liquidation_price = None;
                Some(recovery_kind(state.critical_entry_liquidation_price, liquidation_price))
            }
            _ => None,
        };

        let Some(kind) = edge else {
            return Evaluation {
                state: next,
                trigger: None,
            };
        };

        self.deliver(state, next, kind, Some(distance), recovery, now)
    }

    /// Apply the cooldown to an edge and stamp the alert when it goes out.
    fn deliver(
        &self,
        previous: &AlertState,
        mut next: AlertState,
        kind: AlertEventType,
        distance_pct: Option<Decimal>,
        recovery: Option<RecoveryKind>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        if self.in_cooldown(previous, kind, now) {
            debug!(
                event = %kind,
                distance_pct = ?distance_pct,
                "Alert suppressed by cooldown"
            );
            return Evaluation {
                state: next,
                trigger: None,
            };
        }

        next.last_alerts.insert(kind, now);
        Evaluation {
            state: next,
            trigger: Some(AlertTrigger {
                kind,
                distance_pct,
                recovery,
            }),
        }
    }

    fn in_cooldown(&self, state: &AlertState, kind: AlertEventType, now: DateTime<Utc>) -> bool {
        state
            .last_alerts
            .get(&kind)
            .is_some_and(|at| now - *at < self.thresholds.cooldown)
    }
}

fn recovery_kind(entry: Option<Decimal>, current: Option<Decimal>) -> RecoveryKind {
    match (entry, current) {
        (Some(from), Some(to)) if from != to => RecoveryKind::LiquidationPriceMoved { from, to },
        (Some(_), Some(_)) => RecoveryKind::PriceRetracement,
        _ => RecoveryKind::Unconfirmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(cooldown_secs: i64) -> AlertStateMachine {
        AlertStateMachine::new(AlertThresholds {
            cooldown: Duration::seconds(cooldown_secs),
            ..Default::default()
        })
    }

    /// Feed samples one second apart, returning every fired trigger.
    fn run(machine: &AlertStateMachine, samples: &[Decimal]) -> (AlertState, Vec<AlertTrigger>) {
        let start = Utc::now();
        let mut state = AlertState::default();
        let mut fired = Vec::new();
        for (i, d) in samples.iter().enumerate() {
            let eval = machine.evaluate(&state, Some(*d), Some(dec!(90)), start + Duration::seconds(i as i64));
            state = eval.state;
            fired.extend(eval.trigger);
        }
        (state, fired)
    }

    #[test]
    fn test_oscillation_below_recovery_fires_single_critical() {
        let machine = machine(0);
        let samples = [dec!(5.0), dec!(0.30), dec!(0.30), dec!(0.05), dec!(0.40), dec!(0.05)];
        let (state, fired) = run(&machine, &samples);

        let critical: Vec<_> = fired.iter().filter(|t| t.kind == AlertEventType::Critical).collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].distance_pct, Some(dec!(0.05)));
        assert!(fired.iter().all(|t| t.kind != AlertEventType::Recovery));
        assert_eq!(state.zone, AlertZone::Critical);
    }

    #[test]
    fn test_proximity_then_critical_then_recovery() {
        let machine = machine(0);
        let samples = [dec!(3.0), dec!(0.2), dec!(0.1), dec!(0.6)];
        let (state, fired) = run(&machine, &samples);

        let kinds: Vec<_> = fired.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertEventType::Proximity, AlertEventType::Critical, AlertEventType::Recovery]
        );
        assert_eq!(state.zone, AlertZone::Normal);
        assert_eq!(state.critical_entry_liquidation_price, None);
    }

    #[test]
    fn test_jump_straight_to_critical_skips_proximity() {
        let machine = machine(0);
        let (_, fired) = run(&machine, &[dec!(2.0), dec!(0.01)]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, AlertEventType::Critical);
    }

    #[test]
    fn test_hysteresis_band_holds_zone() {
        let machine = machine(0);
        // 0.3 and 0.45 sit between proximity (0.25) and recovery (0.5)
        let (state, fired) = run(&machine, &[dec!(0.2), dec!(0.3), dec!(0.45), dec!(0.2)]);
        assert_eq!(fired.len(), 1);
        assert_eq!(state.zone, AlertZone::Proximity);
    }

    #[test]
    fn test_cooldown_suppresses_repeat_but_tracks_zone() {
        let machine = machine(600);
        // Critical, recover, critical again within ten minutes
        let (state, fired) = run(&machine, &[dec!(0.1), dec!(0.9), dec!(0.1)]);

        let kinds: Vec<_> = fired.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![AlertEventType::Critical, AlertEventType::Recovery]);
        assert_eq!(state.zone, AlertZone::Critical);
    }

    #[test]
    fn test_recovery_distinguishes_margin_top_up() {
        let machine = machine(0);
        let now = Utc::now();

        let entered = machine.evaluate(&AlertState::default(), Some(dec!(0.1)), Some(dec!(90)), now);
        assert_eq!(entered.state.critical_entry_liquidation_price, Some(dec!(90)));

        let topped_up = machine.evaluate(&entered.state, Some(dec!(5)), Some(dec!(80)), now);
        assert_eq!(
            topped_up.trigger.and_then(|t| t.recovery),
            Some(RecoveryKind::LiquidationPriceMoved { from: dec!(90), to: dec!(80) })
        );

        let retraced = machine.evaluate(&entered.state, Some(dec!(5)), Some(dec!(90)), now);
        assert_eq!(
            retraced.trigger.and_then(|t| t.recovery),
            Some(RecoveryKind::PriceRetracement)
        );
    }

    #[test]
    fn test_missing_distance_is_ignored() {
        let machine = machine(0);
        let state = AlertState {
            zone: AlertZone::Critical,
            ..Default::default()
        };
        let eval = machine.evaluate(&state, None, None, Utc::now());
        assert_eq!(eval.state, state);
        assert!(eval.trigger.is_none());
    }

    #[test]
    fn test_losing_liquidation_price_recovers() {
        let machine = machine(0);
        let now = Utc::now();
        let critical = machine.evaluate(&AlertState::default(), Some(dec!(0.05)), Some(dec!(95)), now);
        assert_eq!(critical.state.zone, AlertZone::Critical);

        let eval = machine.evaluate(&critical.state, None, None, now + Duration::seconds(1));

        assert_eq!(eval.state.zone, AlertZone::Normal);
        assert_eq!(eval.state.critical_entry_liquidation_price, None);
        let trigger = eval.trigger.unwrap();
        assert_eq!(trigger.kind, AlertEventType::Recovery);
        assert_eq!(trigger.distance_pct, None);
        assert_eq!(
            trigger.recovery,
            Some(RecoveryKind::LiquidationRemoved { from: Some(dec!(95)) })
        );

        // Nothing further once back in Normal
        let quiet = machine.evaluate(&eval.state, None, None, now + Duration::seconds(2));
        assert_eq!(quiet.trigger, None);
    }
}
