//! SQLite-backed [`PersistenceStore`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PersistenceStore, RetryPolicy, StoreError};
use crate::alert::{AlertState, AlertZone};
use crate::position::{CachedPosition, MarginMode, Position, RefreshTier, Side};

const UPSERT_POSITION: &str = r#"
    INSERT INTO positions (position_key, address, token, exchange, side, size, leverage,
                           margin_mode, entry_price, mark_price, liquidation_price,
                           position_value, unrealized_pnl, margin_used, distance_pct,
                           refresh_tier, last_full_refresh, last_price_update,
                           alert_zone, last_alerts, critical_entry_liq, alert_message_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22)
    ON CONFLICT(position_key) DO UPDATE SET
        size = excluded.size,
        leverage = excluded.leverage,
        margin_mode = excluded.margin_mode,
        entry_price = excluded.entry_price,
        mark_price = excluded.mark_price,
        liquidation_price = excluded.liquidation_price,
        position_value = excluded.position_value,
        unrealized_pnl = excluded.unrealized_pnl,
        margin_used = excluded.margin_used,
        distance_pct = excluded.distance_pct,
        refresh_tier = excluded.refresh_tier,
        last_full_refresh = excluded.last_full_refresh,
        last_price_update = excluded.last_price_update,
        alert_zone = excluded.alert_zone,
        last_alerts = excluded.last_alerts,
        critical_entry_liq = excluded.critical_entry_liq,
        alert_message_id = excluded.alert_message_id
"#;

/// SQLite persistence for monitored positions.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create {:?}: {}", parent, e)))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(250))?;

        let store = Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        };
        store.init_schema()?;

        info!("Position store initialized at {:?}", path);
        Ok(store)
    }

    /// In-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                position_key TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                token TEXT NOT NULL,
                exchange TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                margin_mode TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                mark_price TEXT NOT NULL,
                liquidation_price TEXT,
                position_value TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                margin_used TEXT NOT NULL,
                distance_pct TEXT,
                refresh_tier TEXT NOT NULL,
                last_full_refresh TEXT NOT NULL,
                last_price_update TEXT NOT NULL,
                alert_zone TEXT NOT NULL DEFAULT 'normal',
                last_alerts TEXT NOT NULL DEFAULT '{}',
                critical_entry_liq TEXT,
                alert_message_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_address ON positions(address);

            CREATE TABLE IF NOT EXISTS monitor_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn upsert(conn: &Connection, pos: &CachedPosition) -> Result<(), StoreError> {
        let p = &pos.position;
        let last_alerts = serde_json::to_string(&pos.alert.last_alerts)?;
        conn.execute(
            UPSERT_POSITION,
            params![
                pos.key,
                p.address,
                p.token,
                p.exchange,
                p.side.as_str(),
                p.size.to_string(),
                p.leverage,
                p.margin_mode.as_str(),
                p.entry_price.to_string(),
                p.mark_price.to_string(),
                p.liquidation_price.map(|v| v.to_string()),
                p.position_value.to_string(),
                p.unrealized_pnl.to_string(),
                p.margin_used.to_string(),
                pos.distance_pct.map(|v| v.to_string()),
                pos.refresh_tier.as_str(),
                pos.last_full_refresh.to_rfc3339(),
                pos.last_price_update.to_rfc3339(),
                pos.alert.zone.as_str(),
                last_alerts,
                pos.alert.critical_entry_liquidation_price.map(|v| v.to_string()),
                pos.alert_message_id,
            ],
        )?;
        Ok(())
    }

    /// Number of persisted positions per tier, as last written.
    pub fn tier_summary(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT refresh_tier, COUNT(*) FROM positions GROUP BY refresh_tier ORDER BY refresh_tier",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl PersistenceStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<CachedPosition>, StoreError> {
        self.retry.run("load_all", || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                r#"
                SELECT position_key, address, token, exchange, side, size, leverage, margin_mode,
                       entry_price, mark_price, liquidation_price, position_value, unrealized_pnl,
                       margin_used, last_full_refresh, last_price_update, alert_zone,
                       last_alerts, critical_entry_liq, alert_message_id, refresh_tier
                FROM positions
                "#,
            )?;

            let rows = stmt
                .query_map([], |row| Ok(decode_row(row)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut positions = Vec::with_capacity(rows.len());
            for row in rows {
                match row {
                    Ok(pos) => positions.push(pos),
                    Err(e) => warn!(error = %e, "Skipping unreadable persisted position"),
                }
            }

            debug!(positions = positions.len(), "Loaded positions from database");
            Ok(positions)
        })
    }

    fn save(&self, position: &CachedPosition) -> Result<(), StoreError> {
        self.retry.run("save", || Self::upsert(&self.conn.lock(), position))
    }

    fn save_batch(&self, positions: &[CachedPosition]) -> Result<(), StoreError> {
        if positions.is_empty() {
            return Ok(());
        }

        self.retry.run("save_batch", || {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;
            for pos in positions {
                Self::upsert(&tx, pos)?;
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(count = positions.len(), "Saved position batch");
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        self.retry.run("delete", || {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;
            for key in keys {
                tx.execute("DELETE FROM positions WHERE position_key = ?1", params![key])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.retry.run("get_state", || {
            let value = self
                .conn
                .lock()
                .query_row(
                    "SELECT value FROM monitor_state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.retry.run("set_state", || {
            self.conn.lock().execute(
                r#"
                INSERT INTO monitor_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3
                "#,
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

fn decode_row(row: &Row<'_>) -> Result<CachedPosition, StoreError> {
    let key: String = row.get(0)?;
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.clone(),
        reason,
    };

    let decimal = |idx: usize| -> Result<Decimal, StoreError> {
        let raw: String = row.get(idx)?;
        Decimal::from_str(&raw).map_err(|e| corrupt(format!("column {idx}: {e}")))
    };
    let opt_decimal = |idx: usize| -> Result<Option<Decimal>, StoreError> {
        let raw: Option<String> = row.get(idx)?;
        raw.map(|s| Decimal::from_str(&s).map_err(|e| corrupt(format!("column {idx}: {e}"))))
            .transpose()
    };
    let timestamp = |idx: usize| -> Result<DateTime<Utc>, StoreError> {
        let raw: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("column {idx}: {e}")))
    };

    let side: String = row.get(4)?;
    let margin_mode: String = row.get(7)?;
    let position = Position {
        address: row.get(1)?,
        token: row.get(2)?,
        exchange: row.get(3)?,
        side: Side::from_str(&side).map_err(&corrupt)?,
        size: decimal(5)?,
        leverage: row.get(6)?,
        margin_mode: MarginMode::from_str(&margin_mode).map_err(&corrupt)?,
        entry_price: decimal(8)?,
        mark_price: decimal(9)?,
        liquidation_price: opt_decimal(10)?,
        position_value: decimal(11)?,
        unrealized_pnl: decimal(12)?,
        margin_used: decimal(13)?,
    };

    let zone: String = row.get(16)?;
    let last_alerts: String = row.get(17)?;
    let alert = AlertState {
        zone: AlertZone::from_str(&zone).map_err(&corrupt)?,
        last_alerts: serde_json::from_str(&last_alerts)?,
        critical_entry_liquidation_price: opt_decimal(18)?,
    };

    // The cache reclassifies on load; the stored tier is what the last writer saw
    let refresh_tier: String = row.get(20)?;
    let distance_pct = position.distance_pct();
    Ok(CachedPosition {
        key: key.clone(),
        distance_pct,
        refresh_tier: RefreshTier::from_str(&refresh_tier).map_err(&corrupt)?,
        last_full_refresh: timestamp(14)?,
        last_price_update: timestamp(15)?,
        alert,
        alert_message_id: row.get(19)?,
        position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertEventType;
    use crate::position::tests::sample_position;
    use crate::position::TierThresholds;
    use rust_decimal_macros::dec;

    fn cached(address: &str, token: &str) -> CachedPosition {
        let pos = sample_position(address, token, Side::Long, dec!(100), Some(dec!(95)));
        CachedPosition::new(pos, &TierThresholds::default(), Utc::now())
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let store = SqliteStore::in_memory().unwrap();

        let mut pos = cached("0xabc", "BTC");
        pos.refresh_tier = RefreshTier::Critical;
        pos.alert.zone = AlertZone::Critical;
        pos.alert.record_alert(AlertEventType::Critical, Utc::now());
        pos.alert.critical_entry_liquidation_price = Some(dec!(95));
        pos.alert_message_id = Some("msg-1".to_string());
        store.save(&pos).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[0];
        assert_eq!(restored.key, pos.key);
        assert_eq!(restored.position.liquidation_price, Some(dec!(95)));
        assert_eq!(restored.refresh_tier, RefreshTier::Critical);
        assert_eq!(store.tier_summary().unwrap(), vec![("critical".to_string(), 1)]);
        assert_eq!(restored.alert.zone, AlertZone::Critical);
        assert!(restored.alert.last_alerts.contains_key(&AlertEventType::Critical));
        assert_eq!(restored.alert_message_id.as_deref(), Some("msg-1"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let mut pos = cached("0xabc", "ETH");

        store.save(&pos).unwrap();
        store.save(&pos).unwrap();
        pos.position.mark_price = dec!(101);
        store.save_batch(&[pos.clone()]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].position.mark_price, dec!(101));
    }

    #[test]
    fn test_delete_and_state() {
        let store = SqliteStore::in_memory().unwrap();
        let a = cached("0xaaa", "BTC");
        let b = cached("0xbbb", "BTC");
        store.save_batch(&[a.clone(), b.clone()]).unwrap();

        store.delete(&[a.key.clone()]).unwrap();
        let remaining: Vec<_> = store.load_all().unwrap().into_iter().map(|p| p.key).collect();
        assert_eq!(remaining, vec![b.key]);

        assert_eq!(store.get_state("last_discovery").unwrap(), None);
        store.set_state("last_discovery", "2024-01-01T00:00:00Z").unwrap();
        store.set_state("last_discovery", "2024-01-02T00:00:00Z").unwrap();
        assert_eq!(
            store.get_state("last_discovery").unwrap().as_deref(),
            Some("2024-01-02T00:00:00Z")
        );
    }

    #[test]
    fn test_custom_retry_policy_store() {
        let store = SqliteStore::in_memory().unwrap().with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        });
        assert_eq!(store.retry.max_attempts, 2);

        let pos = cached("0xabc", "BTC");
        store.save(&pos).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_unliquidatable_position_persists_null() {
        let store = SqliteStore::in_memory().unwrap();
        let pos = CachedPosition::new(
            sample_position("0xabc", "SOL", Side::Short, dec!(150), None),
            &TierThresholds::default(),
            Utc::now(),
        );
        store.save(&pos).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].position.liquidation_price, None);
        assert_eq!(loaded[0].distance_pct, None);
    }
}
