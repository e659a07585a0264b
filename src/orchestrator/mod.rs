//! Monitor control loop.
//!
//! The [`Orchestrator`] owns the cache and both schedulers and drives one
//! cooperative loop. Each cycle runs its phases in order:
//! - Prices: fetch mark prices per exchange and reclassify every position
//! - Refresh: re-read the addresses of positions the tier scheduler marks due
//! - Alerts: feed every distance to the alert state machine, dispatch edges
//! - Discovery: sweep candidate wallets when the adaptive interval elapses
//! - Maintenance: age out positions below the watch threshold, check invariants
//!
//! Network reads fan out under a shared semaphore and a per-request timeout;
//! the phase joins every request before moving on.

mod outcome;

pub use outcome::{CycleReport, DiscoveryOutcome, MaintenanceReport, RefreshOutcome};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEventType, AlertMetadata, AlertSink, AlertStateMachine};
use crate::cache::{price_key, LoadOutcome, PositionCache, PriceMap, PriceUpdate};
use crate::config::Config;
use crate::persistence::{PersistenceStore, STATE_WATCHED_ADDRESSES};
use crate::position::{CachedPosition, Position, RefreshTier};
use crate::scheduler::{DiscoveryScheduler, TieredRefreshScheduler};
use crate::sources::{CandidateSource, PositionSource, PriceSource, SourceError};

/// Loop pacing and admission rules.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Exchanges to watch; the first one is the primary
    pub exchanges: Vec<String>,
    pub max_refresh_per_cycle: usize,
    pub cycle_interval: Duration,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub min_notional: Decimal,
    pub max_watch_distance_pct: Decimal,
    pub maintenance_interval: chrono::Duration,
    pub cache_max_age: chrono::Duration,
    pub alert_on_new_positions: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exchanges: config
                .venue
                .exchanges
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            max_refresh_per_cycle: config.monitor.max_refresh_per_cycle,
            cycle_interval: Duration::from_millis(config.monitor.cycle_interval_ms),
            request_timeout: Duration::from_secs(config.venue.request_timeout_secs),
            max_concurrent_requests: config.venue.max_concurrent_requests.max(1),
            min_notional: config.monitor.min_notional,
            max_watch_distance_pct: config.monitor.max_watch_distance_pct,
            maintenance_interval: chrono::Duration::seconds(config.monitor.maintenance_interval_secs as i64),
            cache_max_age: chrono::Duration::seconds(config.monitor.cache_max_age_secs as i64),
            alert_on_new_positions: config.alerts.alert_on_new_positions,
        }
    }
}

/// Outside-world dependencies of the monitor.
#[derive(Clone)]
pub struct Collaborators {
    pub prices: Arc<dyn PriceSource>,
    pub positions: Arc<dyn PositionSource>,
    pub candidates: Arc<dyn CandidateSource>,
    pub sink: Arc<dyn AlertSink>,
    pub store: Arc<dyn PersistenceStore>,
}

type FetchResult = (String, Result<Vec<Position>, SourceError>);

/// Tiered liquidation monitor.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    cache: PositionCache,
    refresh: TieredRefreshScheduler,
    discovery: DiscoveryScheduler,
    alerts: AlertStateMachine,
    sources: Collaborators,
    limiter: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    /// Manually watched addresses; exempt from the distance bound
    watched: HashSet<String>,
    last_maintenance: Option<DateTime<Utc>>,
    cycles: u64,
}

impl Orchestrator {
    pub fn new(config: &Config, sources: Collaborators) -> Self {
        let settings = OrchestratorSettings::from_config(config);
        let limiter = Arc::new(Semaphore::new(settings.max_concurrent_requests));

        Self {
            cache: PositionCache::new(config.tier_thresholds(), Arc::clone(&sources.store)),
            refresh: TieredRefreshScheduler::new(config.tier_intervals()),
            discovery: DiscoveryScheduler::new(config.discovery_settings(), Arc::clone(&sources.store)),
            alerts: AlertStateMachine::new(config.alert_thresholds()),
            settings,
            sources,
            limiter,
            shutdown: Arc::new(AtomicBool::new(false)),
            watched: HashSet::new(),
            last_maintenance: None,
            cycles: 0,
        }
    }

    pub fn cache(&self) -> &PositionCache {
        &self.cache
    }

    pub fn refresh_scheduler(&self) -> &TieredRefreshScheduler {
        &self.refresh
    }

    pub fn discovery(&self) -> &DiscoveryScheduler {
        &self.discovery
    }

    pub fn watched_addresses(&self) -> &HashSet<String> {
        &self.watched
    }

    /// Flag that stops the loop when set. Shared with signal handlers.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Ask the loop to exit after the current phase.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Recover persisted state, then run cycles until stopped.
    pub async fn start(&mut self) -> Result<()> {
        self.recover_at(Utc::now())?;

        info!(
            exchanges = ?self.settings.exchanges,
            positions = self.cache.len(),
            known_addresses = self.discovery.known_addresses().len(),
            "🚀 Starting monitor loop"
        );

        while !self.is_stopping() {
            let report = self.run_cycle_at(Utc::now()).await;
            debug!(
                cycle = self.cycles,
                refreshed = report.refresh.refreshed,
                alerts = report.alerts_sent,
                "Cycle complete"
            );
            tokio::time::sleep(self.settings.cycle_interval).await;
        }

        info!(cycles = self.cycles, positions = self.cache.len(), "🛑 Monitor loop stopped");
        Ok(())
    }

    /// Rebuild the cache and discovery state from the store.
    ///
    /// A stale snapshot is discarded and a discovery sweep forced.
    pub fn recover_at(&mut self, now: DateTime<Utc>) -> Result<LoadOutcome> {
        let outcome = self
            .cache
            .load_from_store(self.settings.cache_max_age, now)
            .context("Failed to restore position cache")?;
        self.discovery
            .restore()
            .context("Failed to restore discovery state")?;

        if let LoadOutcome::Stale { age, discarded } = &outcome {
            warn!(
                age_mins = age.num_minutes(),
                discarded,
                "📂 Snapshot too old, forcing discovery sweep"
            );
            self.discovery.force();
        }

        self.reload_watched();

        Ok(outcome)
    }

    /// Run one full cycle.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycles += 1;
        let mut report = CycleReport::default();

        // ═══════════════════════════════════════════════════════════════
        // PHASE 1: Prices
        // ═══════════════════════════════════════════════════════════════
        report.prices = self.refresh_prices(now).await;
        if self.is_stopping() {
            return report;
        }

        // ═══════════════════════════════════════════════════════════════
        // PHASE 2: Scheduled refreshes
        // ═══════════════════════════════════════════════════════════════
        report.refresh = self.run_due_refreshes(now).await;
        if self.is_stopping() {
            return report;
        }

        // ═══════════════════════════════════════════════════════════════
        // PHASE 3: Alerts
        // ═══════════════════════════════════════════════════════════════
        report.alerts_sent = self.evaluate_alerts(now).await;

        // ═══════════════════════════════════════════════════════════════
        // PHASE 4: Discovery
        // ═══════════════════════════════════════════════════════════════
        if !self.is_stopping() && self.discovery.should_run_at(&self.cache.tier_counts(), now) {
            report.discovery = Some(self.run_discovery(now).await);
        }

        // ═══════════════════════════════════════════════════════════════
        // PHASE 5: Maintenance
        // ═══════════════════════════════════════════════════════════════
        let maintenance_due = self
            .last_maintenance
            .map_or(true, |last| now - last >= self.settings.maintenance_interval);
        if maintenance_due {
            report.maintenance = Some(self.run_maintenance(now));
        }

        report
    }

    /// Fetch mark prices for every exchange and reclassify the cache.
    ///
    /// Returns `None` when no exchange produced a price.
    pub async fn refresh_prices(&mut self, now: DateTime<Utc>) -> Option<PriceUpdate> {
        let tasks = self.settings.exchanges.iter().enumerate().map(|(index, exchange)| {
            let source = Arc::clone(&self.sources.prices);
            let limiter = Arc::clone(&self.limiter);
            let timeout = self.settings.request_timeout;
            let exchange = exchange.clone();
            async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => match tokio::time::timeout(timeout, source.mark_prices(&exchange)).await {
                        Ok(result) => result,
                        Err(_) => Err(SourceError::Timeout(timeout.as_secs())),
                    },
                    Err(_) => Err(SourceError::Unavailable("request limiter closed".to_string())),
                };
                (index == 0, exchange, result)
            }
        });
        let results = join_all(tasks).await;

        let mut prices = PriceMap::new();
        for (primary, exchange, result) in results {
            match result {
                Ok(quotes) => {
                    for (token, price) in quotes {
                        prices.insert(price_key(&exchange, &token), price);
                        if primary {
                            prices.insert(token, price);
                        }
                    }
                }
                Err(e) => warn!(exchange = %exchange, error = %e, "⚠️  Price fetch failed"),
            }
        }

        if prices.is_empty() {
            warn!("⚠️  No prices this cycle, skipping cache price update");
            return None;
        }

        match self.cache.update_prices(&prices, now) {
            Ok(update) => {
                for change in &update.tier_changes {
                    info!(key = %change.key, from = %change.from, to = %change.to, "Tier change");
                }
                Some(update)
            }
            Err(e) => {
                error!(error = %e, "❌ Failed to persist price update");
                None
            }
        }
    }

    /// Re-read the addresses of every position due under its tier cadence.
    ///
    /// A failed read leaves the last known state untouched; the keys are still
    /// marked as attempted so they retry on their normal cadence.
    pub async fn run_due_refreshes(&mut self, now: DateTime<Utc>) -> RefreshOutcome {
        let due = self
            .refresh
            .get_due_at(&self.cache, self.settings.max_refresh_per_cycle, now);
        let mut outcome = RefreshOutcome {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return outcome;
        }

        // Group by address, keeping scheduler priority order
        let mut order: Vec<String> = Vec::new();
        let mut keys_by_address: HashMap<String, Vec<String>> = HashMap::new();
        for key in due {
            let Some(address) = self.cache.get(&key).map(|p| p.position.address.clone()) else {
                continue;
            };
            let keys = keys_by_address.entry(address.clone()).or_default();
            if keys.is_empty() {
                order.push(address);
            }
            keys.push(key);
        }
        outcome.addresses = order.len();

        for (address, result) in self.fetch_addresses(order).await {
            if let Some(keys) = keys_by_address.get(&address) {
                self.refresh.mark_all_refreshed_at(keys, now);
            }

            let positions = match result {
                Ok(positions) => positions,
                Err(e) => {
                    warn!(address = %address, error = %e, "⚠️  Position refresh failed");
                    outcome.failed.push(address);
                    continue;
                }
            };

            let live: HashSet<String> = positions.iter().map(Position::key).collect();
            let max_distance = self.distance_bound(&address);
            let accepted: Vec<Position> = positions
                .into_iter()
                .filter(|p| {
                    self.cache.contains(&p.key())
                        || meets_watch_threshold(p, self.settings.min_notional, max_distance)
                })
                .collect();

            for p in &accepted {
                let key = p.key();
                if !self.cache.contains(&key) {
                    outcome.admitted.push(key);
                }
            }
            outcome.refreshed += accepted.len();

            if let Err(e) = self.cache.update_batch(accepted, now) {
                error!(address = %address, error = %e, "❌ Failed to persist refreshed positions");
            }
            // One read refreshes every cached position of the address
            let refreshed: Vec<String> = live.iter().filter(|k| self.cache.contains(k)).cloned().collect();
            self.refresh.mark_all_refreshed_at(&refreshed, now);

            let scope = HashSet::from([address.clone()]);
            match self.cache.remove_not_in(&live, &scope) {
                Ok(closed) => {
                    self.refresh.forget(&closed);
                    outcome.closed.extend(closed);
                }
                Err(e) => error!(address = %address, error = %e, "❌ Failed to persist closed positions"),
            }
        }

        self.refresh.mark_all_refreshed_at(&outcome.admitted, now);
        if !outcome.admitted.is_empty() {
            let admitted = outcome.admitted.clone();
            self.announce_new_positions(&admitted, now).await;
        }

        outcome
    }

    /// Feed every cached distance to the alert state machine.
    ///
    /// Returns the number of alerts delivered.
    pub async fn evaluate_alerts(&mut self, now: DateTime<Utc>) -> usize {
        let snapshots: Vec<CachedPosition> = RefreshTier::ALL
            .iter()
            .flat_map(|tier| self.cache.by_tier(*tier))
            .cloned()
            .collect();

        let mut sent = 0;
        for mut snapshot in snapshots {
            let evaluation = self.alerts.evaluate(
                &snapshot.alert,
                snapshot.distance_pct,
                snapshot.position.liquidation_price,
                now,
            );

            if evaluation.state != snapshot.alert {
                if let Err(e) = self.cache.set_alert_state(&snapshot.key, evaluation.state.clone()) {
                    error!(key = %snapshot.key, error = %e, "❌ Failed to persist alert state");
                }
            }

            let Some(trigger) = evaluation.trigger else {
                continue;
            };

            snapshot.alert = evaluation.state;
            let metadata = AlertMetadata {
                distance_pct: trigger.distance_pct,
                tier: snapshot.refresh_tier,
                recovery: trigger.recovery,
                reply_to: snapshot.alert_message_id.clone(),
            };
            if self.dispatch(trigger.kind, &snapshot, &metadata).await {
                sent += 1;
            }
        }
        sent
    }

    /// Run a discovery sweep now.
    ///
    /// Scans candidates and known addresses that have no cached position.
    /// A candidate source failure degrades to rescanning known addresses.
    pub async fn run_discovery(&mut self, now: DateTime<Utc>) -> DiscoveryOutcome {
        let candidates = match self.sources.candidates.candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "⚠️  Candidate source failed, rescanning known addresses only");
                Vec::new()
            }
        };

        let bootstrap = self.discovery.known_addresses().is_empty();
        let new_addresses = self.discovery.find_new(&candidates);
        let cached = self.cache.addresses();

        let mut scan: Vec<String> = candidates
            .iter()
            .chain(self.discovery.known_addresses().iter())
            .filter(|a| !cached.contains(*a))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        scan.sort();

        info!(
            candidates = candidates.len(),
            new_addresses = new_addresses.len(),
            scanning = scan.len(),
            "🔍 Discovery sweep started"
        );

        let mut outcome = DiscoveryOutcome {
            candidates: candidates.len(),
            new_addresses: new_addresses.len(),
            scanned: scan.len(),
            bootstrap,
            ..Default::default()
        };

        let mut admitted = Vec::new();
        for (address, result) in self.fetch_addresses(scan).await {
            match result {
                Ok(positions) => {
                    let max_distance = self.distance_bound(&address);
                    admitted.extend(
                        positions
                            .into_iter()
                            .filter(|p| meets_watch_threshold(p, self.settings.min_notional, max_distance)),
                    );
                }
                Err(e) => {
                    debug!(address = %address, error = %e, "Discovery read failed");
                    outcome.failed += 1;
                }
            }
        }

        outcome.admitted = admitted
            .iter()
            .map(Position::key)
            .filter(|k| !self.cache.contains(k))
            .collect();
        if let Err(e) = self.cache.update_batch(admitted, now) {
            error!(error = %e, "❌ Failed to persist discovered positions");
        }
        self.refresh.mark_all_refreshed_at(&outcome.admitted, now);

        if let Err(e) = self.discovery.mark_complete_at(&new_addresses, now) {
            error!(error = %e, "❌ Failed to persist discovery state");
        }

        info!(
            admitted = outcome.admitted.len(),
            failed = outcome.failed,
            watching = self.cache.len(),
            "🔍 Discovery sweep finished"
        );

        if !bootstrap && !outcome.admitted.is_empty() {
            let admitted = outcome.admitted.clone();
            self.announce_new_positions(&admitted, now).await;
        }

        outcome
    }

    /// Start watching every qualifying position of `address`, regardless of
    /// its distance to liquidation. Returns the keys admitted.
    pub async fn watch_address(&mut self, address: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let address = address.trim().to_ascii_lowercase();
        anyhow::ensure!(!address.is_empty(), "address must not be empty");

        let Some((_, result)) = self.fetch_addresses(vec![address.clone()]).await.into_iter().next() else {
            anyhow::bail!("monitor is shutting down");
        };
        let positions = result.with_context(|| format!("Failed to fetch positions for {}", address))?;

        let admitted: Vec<Position> = positions
            .into_iter()
            .filter(|p| meets_watch_threshold(p, self.settings.min_notional, None))
            .collect();
        let keys: Vec<String> = admitted.iter().map(Position::key).collect();
        let new_keys: Vec<String> = keys.iter().filter(|k| !self.cache.contains(k)).cloned().collect();

        self.cache
            .update_batch(admitted, now)
            .context("Failed to persist watched positions")?;
        self.refresh.mark_all_refreshed_at(&keys, now);
        self.discovery
            .remember(&[address.clone()])
            .context("Failed to persist known addresses")?;

        if self.watched.insert(address.clone()) {
            // Another process may have added watches since this one loaded
            self.reload_watched();
            let mut watched: Vec<&String> = self.watched.iter().collect();
            watched.sort();
            self.sources
                .store
                .set_state(STATE_WATCHED_ADDRESSES, &serde_json::to_string(&watched)?)
                .context("Failed to persist watched addresses")?;
        }

        info!(address = %address, positions = keys.len(), "👀 Watching address");
        self.announce_new_positions(&new_keys, now).await;
        Ok(keys)
    }

    /// Age out positions below the watch threshold and verify cache invariants.
    pub fn run_maintenance(&mut self, now: DateTime<Utc>) -> MaintenanceReport {
        self.last_maintenance = Some(now);
        self.reload_watched();

        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|p| {
                let max_distance = self.distance_bound(&p.position.address);
                !meets_watch_threshold(&p.position, self.settings.min_notional, max_distance)
            })
            .map(|p| p.key.clone())
            .collect();

        let mut report = MaintenanceReport::default();
        if !stale.is_empty() {
            match self.cache.remove_many(&stale) {
                Ok(removed) => {
                    for pos in &removed {
                        info!(
                            key = %pos.key,
                            distance_pct = ?pos.distance_pct,
                            value = %pos.position.position_value,
                            "Position below watch threshold, removed"
                        );
                    }
                    report.aged_out = removed.into_iter().map(|p| p.key).collect();
                }
                Err(e) => {
                    error!(error = %e, "❌ Failed to persist aged-out positions");
                    report.aged_out = stale;
                }
            }
        }

        report.forgotten = self.refresh.retain_cached(&self.cache);
        report.counts = self.cache.tier_counts();
        report.oldest_refresh = self.cache.oldest_refresh();

        if let Err(violation) = self.cache.check_invariants() {
            error!(violation = %violation, "🚨 Cache invariant violated");
            report.invariant_violation = Some(violation);
        }

        info!(
            critical = report.counts.critical,
            high = report.counts.high,
            normal = report.counts.normal,
            aged_out = report.aged_out.len(),
            oldest_refresh = ?report.oldest_refresh,
            "🧹 Maintenance complete"
        );
        report
    }

    /// Merge the persisted watch list into memory. Only ever adds.
    fn reload_watched(&mut self) {
        match self.sources.store.get_state(STATE_WATCHED_ADDRESSES) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(addresses) => self.watched.extend(addresses),
                Err(e) => warn!(error = %e, "Ignoring unreadable watched address list"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read watched addresses"),
        }
    }

    fn distance_bound(&self, address: &str) -> Option<Decimal> {
        if self.watched.contains(address) {
            None
        } else {
            Some(self.settings.max_watch_distance_pct)
        }
    }

    /// Read many addresses concurrently, bounded by the request limiter.
    ///
    /// Stops launching reads once shutdown is requested.
    async fn fetch_addresses(&self, addresses: Vec<String>) -> Vec<FetchResult> {
        let mut tasks = Vec::with_capacity(addresses.len());
        for address in addresses {
            if self.is_stopping() {
                break;
            }
            let source = Arc::clone(&self.sources.positions);
            let limiter = Arc::clone(&self.limiter);
            let exchanges = self.settings.exchanges.clone();
            let timeout = self.settings.request_timeout;
            tasks.push(async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => {
                        match tokio::time::timeout(timeout, source.fetch_positions(&address, &exchanges)).await {
                            Ok(result) => result,
                            Err(_) => Err(SourceError::Timeout(timeout.as_secs())),
                        }
                    }
                    Err(_) => Err(SourceError::Unavailable("request limiter closed".to_string())),
                };
                (address, result)
            });
        }
        join_all(tasks).await
    }

    async fn announce_new_positions(&mut self, keys: &[String], now: DateTime<Utc>) {
        if !self.settings.alert_on_new_positions {
            return;
        }
        for key in keys {
            let Some(mut snapshot) = self.cache.get(key).cloned() else {
                continue;
            };
            snapshot.alert.record_alert(AlertEventType::NewPosition, now);
            if let Err(e) = self.cache.set_alert_state(key, snapshot.alert.clone()) {
                error!(key = %key, error = %e, "❌ Failed to persist alert state");
            }
            let metadata = AlertMetadata {
                distance_pct: snapshot.distance_pct,
                tier: snapshot.refresh_tier,
                recovery: None,
                reply_to: None,
            };
            self.dispatch(AlertEventType::NewPosition, &snapshot, &metadata).await;
        }
    }

    /// Deliver one alert and remember its message id. Returns whether it was sent.
    async fn dispatch(&mut self, event: AlertEventType, snapshot: &CachedPosition, metadata: &AlertMetadata) -> bool {
        match self.sources.sink.send(event, snapshot, metadata).await {
            Ok(message_id) => {
                info!(
                    event = %event,
                    key = %snapshot.key,
                    distance_pct = ?metadata.distance_pct,
                    "📣 Alert sent"
                );
                if message_id.is_some() {
                    if let Err(e) = self.cache.set_alert_message_id(&snapshot.key, message_id) {
                        error!(key = %snapshot.key, error = %e, "❌ Failed to persist alert message id");
                    }
                }
                true
            }
            Err(e) => {
                error!(event = %event, key = %snapshot.key, error = %e, "❌ Alert delivery failed");
                false
            }
        }
    }
}

/// Whether a position is worth watching.
///
/// Requires a liquidation price and at least `min_notional` of exposure. When
/// `max_distance_pct` is set the position must also be within that distance.
fn meets_watch_threshold(position: &Position, min_notional: Decimal, max_distance_pct: Option<Decimal>) -> bool {
    let Some(distance) = position.distance_pct() else {
        return false;
    };
    if position.position_value.abs() < min_notional {
        return false;
    }
    max_distance_pct.map_or(true, |max| distance <= max)
}
