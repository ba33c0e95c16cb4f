// =============================================================================
// Alert Store — append-only SQLite persistence
// =============================================================================
//
// WAL mode for concurrent reads during writes, batched inserts inside a
// transaction, and covering indexes on the three query axes (ts, severity,
// symbol).  The connection lives behind a parking_lot Mutex; all access goes
// through short critical sections so the async sink task never starves.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::types::{Alert, AlertKind, MarketType, Severity, Side};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    venue TEXT NOT NULL,
    market TEXT NOT NULL,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    value REAL NOT NULL,
    price REAL NOT NULL,
    slippage REAL NOT NULL,
    side TEXT,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(ts);
CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity);
CREATE INDEX IF NOT EXISTS idx_alerts_symbol ON alerts(symbol);
"#;

/// A persisted alert row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredAlert {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub venue: String,
    pub market: String,
    pub symbol: String,
    pub kind: String,
    pub severity: String,
    pub value: f64,
    pub price: f64,
    pub slippage: f64,
    pub side: Option<String>,
    pub message: String,
}

/// SQLite-backed append-only alert storage.
pub struct AlertStore {
    conn: Mutex<Connection>,
}

impl AlertStore {
    /// Open (or create) the store at `path`. Parent directories are created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open alert db at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialise alert schema")?;

        info!(path = %path.display(), "alert store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and the replay harness.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory db")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialise alert schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one alert; returns its row id.
    pub fn save(&self, alert: &Alert) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts (ts, venue, market, symbol, kind, severity, value, price, slippage, side, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                alert.ts.to_rfc3339(),
                alert.venue,
                alert.market.to_string(),
                alert.symbol,
                alert.kind.as_str(),
                alert.severity.as_str(),
                alert.value,
                alert.price,
                alert.slippage_pct,
                alert.side.map(|s| s.to_string()),
                alert.message,
            ],
        )
        .context("failed to insert alert")?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a batch inside one transaction.
    pub fn save_batch(&self, alerts: &[Alert]) -> Result<usize> {
        if alerts.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO alerts (ts, venue, market, symbol, kind, severity, value, price, slippage, side, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for alert in alerts {
                stmt.execute(params![
                    alert.ts.to_rfc3339(),
                    alert.venue,
                    alert.market.to_string(),
                    alert.symbol,
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.value,
                    alert.price,
                    alert.slippage_pct,
                    alert.side.map(|s| s.to_string()),
                    alert.message,
                ])?;
            }
        }
        tx.commit().context("failed to commit alert batch")?;
        debug!(count = alerts.len(), "alert batch persisted");
        Ok(alerts.len())
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, venue, market, symbol, kind, severity, value, price, slippage, side, message
             FROM alerts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_stored)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Alerts for one symbol, newest first.
    pub fn by_symbol(&self, symbol: &str, limit: usize) -> Result<Vec<StoredAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, venue, market, symbol, kind, severity, value, price, slippage, side, message
             FROM alerts WHERE symbol = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol, limit as i64], row_to_stored)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count of alerts per severity.
    pub fn counts_by_severity(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT severity, COUNT(*) FROM alerts GROUP BY severity")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredAlert> {
    let ts_raw: String = row.get(1)?;
    let ts = DateTime::parse_from_rfc3339(&ts_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(StoredAlert {
        id: row.get(0)?,
        ts,
        venue: row.get(2)?,
        market: row.get(3)?,
        symbol: row.get(4)?,
        kind: row.get(5)?,
        severity: row.get(6)?,
        value: row.get(7)?,
        price: row.get(8)?,
        slippage: row.get(9)?,
        side: row.get(10)?,
        message: row.get(11)?,
    })
}

/// Convenience used by tests and the replay harness.
pub fn sample_alert(symbol: &str, severity: Severity) -> Alert {
    Alert {
        ts: Utc::now(),
        venue: "binance".to_string(),
        market: MarketType::Spot,
        symbol: symbol.to_string(),
        kind: AlertKind::Trade,
        severity,
        value: 100_000.0,
        price: 100.0,
        slippage_pct: 1.0,
        side: Some(Side::Buy),
        message: format!("test alert for {symbol}"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_query_roundtrip() {
        let store = AlertStore::open_in_memory().unwrap();
        let id = store.save(&sample_alert("BTC-USDT", Severity::Medium)).unwrap();
        assert_eq!(id, 1);

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        let row = &recent[0];
        assert_eq!(row.symbol, "BTC-USDT");
        assert_eq!(row.severity, "medium");
        assert_eq!(row.side.as_deref(), Some("BUY"));
        assert!((row.value - 100_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ids_are_monotonic() {
        let store = AlertStore::open_in_memory().unwrap();
        let a = store.save(&sample_alert("A", Severity::Low)).unwrap();
        let b = store.save(&sample_alert("B", Severity::Low)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn batch_insert_and_symbol_query() {
        let store = AlertStore::open_in_memory().unwrap();
        let batch: Vec<Alert> = (0..5)
            .map(|i| {
                sample_alert(
                    if i % 2 == 0 { "ETH-USDT" } else { "BTC-USDT" },
                    Severity::Low,
                )
            })
            .collect();
        assert_eq!(store.save_batch(&batch).unwrap(), 5);

        let eth = store.by_symbol("ETH-USDT", 10).unwrap();
        assert_eq!(eth.len(), 3);
        // Newest first.
        assert!(eth[0].id > eth[1].id);
    }

    #[test]
    fn counts_by_severity() {
        let store = AlertStore::open_in_memory().unwrap();
        store.save(&sample_alert("A", Severity::High)).unwrap();
        store.save(&sample_alert("B", Severity::High)).unwrap();
        store.save(&sample_alert("C", Severity::Low)).unwrap();

        let counts = store.counts_by_severity().unwrap();
        let high = counts.iter().find(|(s, _)| s == "high").unwrap();
        assert_eq!(high.1, 2);
    }

    #[test]
    fn opens_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("alerts.db");
        let store = AlertStore::open(&path).unwrap();
        store.save(&sample_alert("X", Severity::Low)).unwrap();
        drop(store);

        // Reopen and read back.
        let store = AlertStore::open(&path).unwrap();
        assert_eq!(store.recent(10).unwrap().len(), 1);
    }
}
