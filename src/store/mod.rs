//! Durable Store: SQLite-backed persistence for orders, signals, and daily
//! statistics. Grounded in `src/storage/database.py`/`sql.py`/`models.py`
//! for schema and datetime-coercion semantics; the `spawn_blocking` +
//! `parking_lot::Mutex<Connection>` wrapping mirrors the bounded-worker-pool
//! discipline applied to the exchange client (§5).

pub mod models;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::instrument;

use crate::types::{CloseReason, OrderStatus, Side};
use models::{DailyStats, OrderRecord, SignalRecord, StatisticsSummary};

const ORDERS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_name TEXT NOT NULL,
    symbol TEXT NOT NULL,
    order_id TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    entry_price REAL NOT NULL,
    take_profit REAL,
    stop_loss REAL,
    status TEXT NOT NULL,
    opened_at TEXT,
    closed_at TEXT,
    close_price REAL,
    pnl REAL,
    pnl_percent REAL,
    close_reason TEXT,
    created_at TEXT NOT NULL
)";

const SIGNALS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_name TEXT NOT NULL,
    action TEXT NOT NULL,
    dominant_change REAL NOT NULL,
    target_change REAL NOT NULL,
    target_price REAL NOT NULL,
    executed INTEGER NOT NULL,
    created_at TEXT NOT NULL
)";

const DAILY_STATS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS daily_stats (
    date TEXT PRIMARY KEY,
    total_trades INTEGER NOT NULL,
    profitable_trades INTEGER NOT NULL,
    total_pnl REAL NOT NULL,
    win_rate REAL NOT NULL,
    best_trade REAL NOT NULL,
    worst_trade REAL NOT NULL
)";

const ORDERS_STATUS_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)";
const ORDERS_PAIR_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_orders_pair ON orders(pair_name)";
const SIGNALS_PAIR_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_signals_pair ON signals(pair_name)";

/// Accepts `NULL`, an ISO-8601 string, or an integer/real epoch-seconds
/// value. Ported from `_fix_datetime_field`.
fn fix_datetime_field(raw: Option<rusqlite::types::Value>) -> Option<DateTime<Utc>> {
    use rusqlite::types::Value;
    match raw? {
        Value::Null => None,
        Value::Integer(i) => Utc.timestamp_opt(i, 0).single(),
        Value::Real(f) => Utc.timestamp_opt(f as i64, 0).single(),
        Value::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }),
        Value::Blob(_) => None,
    }
}

fn side_from_str(s: &str) -> Side {
    if s.eq_ignore_ascii_case("sell") {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn status_from_str(s: &str) -> OrderStatus {
    match s {
        "OPEN" => OrderStatus::Open,
        "CLOSED" => OrderStatus::Closed,
        "CANCELLED" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn close_reason_from_str(s: Option<String>) -> Option<CloseReason> {
    match s.as_deref() {
        Some("TP") => Some(CloseReason::Tp),
        Some("SL") => Some(CloseReason::Sl),
        Some("MANUAL") => Some(CloseReason::Manual),
        Some(_) => Some(CloseReason::Unknown),
        None => None,
    }
}

/// Max/min P&L among `pnls`, with no implicit zero floor — an all-winning
/// period's worst trade is its smallest win, not 0.0, and vice versa.
fn best_worst_trade(pnls: &[f64]) -> (f64, f64) {
    let best = pnls.iter().cloned().reduce(f64::max).unwrap_or(0.0);
    let worst = pnls.iter().cloned().reduce(f64::min).unwrap_or(0.0);
    (best, worst)
}

fn row_to_order(row: &Row) -> rusqlite::Result<OrderRecord> {
    Ok(OrderRecord {
        id: row.get("id")?,
        pair_name: row.get("pair_name")?,
        symbol: row.get("symbol")?,
        order_id: row.get("order_id")?,
        side: side_from_str(&row.get::<_, String>("side")?),
        quantity: row.get("quantity")?,
        entry_price: row.get("entry_price")?,
        take_profit: row.get("take_profit")?,
        stop_loss: row.get("stop_loss")?,
        status: status_from_str(&row.get::<_, String>("status")?),
        opened_at: fix_datetime_field(row.get("opened_at")?),
        closed_at: fix_datetime_field(row.get("closed_at")?),
        close_price: row.get("close_price")?,
        pnl: row.get("pnl")?,
        pnl_percent: row.get("pnl_percent")?,
        close_reason: close_reason_from_str(row.get("close_reason")?),
        created_at: fix_datetime_field(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

/// Fields an order can be updated with after open (§4.6: `updateOrder`).
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub close_reason: Option<CloseReason>,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute(ORDERS_TABLE, [])?;
        conn.execute(SIGNALS_TABLE, [])?;
        conn.execute(DAILY_STATS_TABLE, [])?;
        conn.execute(ORDERS_STATUS_INDEX, [])?;
        conn.execute(ORDERS_PAIR_INDEX, [])?;
        conn.execute(SIGNALS_PAIR_INDEX, [])?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[instrument(skip(self, order))]
    pub async fn save_order(&self, order: OrderRecord) -> anyhow::Result<i64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO orders (pair_name, symbol, order_id, side, quantity, entry_price, take_profit, \
                 stop_loss, status, opened_at, closed_at, close_price, pnl, pnl_percent, close_reason, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    order.pair_name,
                    order.symbol,
                    order.order_id,
                    order.side.to_string(),
                    order.quantity,
                    order.entry_price,
                    order.take_profit,
                    order.stop_loss,
                    order.status.to_string(),
                    order.opened_at.map(|t| t.to_rfc3339()),
                    order.closed_at.map(|t| t.to_rfc3339()),
                    order.close_price,
                    order.pnl,
                    order.pnl_percent,
                    order.close_reason.map(|r| r.to_string()),
                    order.created_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    #[instrument(skip(self, update))]
    pub async fn update_order(&self, id: i64, update: OrderUpdate) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "UPDATE orders SET \
                    status = COALESCE(?2, status), \
                    closed_at = COALESCE(?3, closed_at), \
                    close_price = COALESCE(?4, close_price), \
                    pnl = COALESCE(?5, pnl), \
                    pnl_percent = COALESCE(?6, pnl_percent), \
                    close_reason = COALESCE(?7, close_reason) \
                 WHERE id = ?1",
                params![
                    id,
                    update.status.map(|s| s.to_string()),
                    update.closed_at.map(|t| t.to_rfc3339()),
                    update.close_price,
                    update.pnl,
                    update.pnl_percent,
                    update.close_reason.map(|r| r.to_string()),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    #[instrument(skip(self))]
    pub async fn get_open_orders(&self, pair_name: Option<String>) -> anyhow::Result<Vec<OrderRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut orders = Vec::new();
            match pair_name {
                Some(pair) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM orders WHERE status = 'OPEN' AND pair_name = ?1 ORDER BY id",
                    )?;
                    let rows = stmt.query_map(params![pair], row_to_order)?;
                    for row in rows {
                        orders.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare("SELECT * FROM orders WHERE status = 'OPEN' ORDER BY id")?;
                    let rows = stmt.query_map([], row_to_order)?;
                    for row in rows {
                        orders.push(row?);
                    }
                }
            }
            Ok(orders)
        })
        .await?
    }

    #[instrument(skip(self, signal))]
    pub async fn save_signal(&self, signal: SignalRecord) -> anyhow::Result<i64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO signals (pair_name, action, dominant_change, target_change, target_price, executed, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    signal.pair_name,
                    signal.action,
                    signal.dominant_change,
                    signal.target_change,
                    signal.target_price,
                    signal.executed,
                    signal.created_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    #[instrument(skip(self))]
    pub async fn mark_signal_executed(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute("UPDATE signals SET executed = 1 WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await?
    }

    #[instrument(skip(self))]
    pub async fn get_statistics_summary(&self, days: i64) -> anyhow::Result<StatisticsSummary> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
            let mut stmt = conn.prepare(
                "SELECT pnl FROM orders WHERE status = 'CLOSED' AND closed_at >= ?1 AND pnl IS NOT NULL",
            )?;
            let pnls: Vec<f64> = stmt
                .query_map(params![cutoff], |row| row.get::<_, f64>(0))?
                .filter_map(Result::ok)
                .collect();

            let total_trades = pnls.len() as i64;
            let profitable_trades = pnls.iter().filter(|p| **p > 0.0).count() as i64;
            let total_pnl: f64 = pnls.iter().sum();
            let win_rate = if total_trades > 0 {
                profitable_trades as f64 / total_trades as f64 * 100.0
            } else {
                0.0
            };
            let (best_trade, worst_trade) = best_worst_trade(&pnls);

            Ok(StatisticsSummary {
                period_days: days,
                total_trades,
                profitable_trades,
                total_pnl,
                win_rate,
                best_trade,
                worst_trade,
            })
        })
        .await?
    }

    #[instrument(skip(self))]
    pub async fn calculate_and_save_daily_stats(&self, date: Option<NaiveDate>) -> anyhow::Result<DailyStats> {
        let conn = self.conn.clone();
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let day_start = date.and_hms_opt(0, 0, 0).unwrap();
            let day_end = date.and_hms_opt(23, 59, 59).unwrap();
            let start = Utc.from_utc_datetime(&day_start).to_rfc3339();
            let end = Utc.from_utc_datetime(&day_end).to_rfc3339();

            let mut stmt = conn.prepare(
                "SELECT pnl FROM orders WHERE status = 'CLOSED' AND closed_at BETWEEN ?1 AND ?2 AND pnl IS NOT NULL",
            )?;
            let pnls: Vec<f64> = stmt
                .query_map(params![start, end], |row| row.get::<_, f64>(0))?
                .filter_map(Result::ok)
                .collect();

            let total_trades = pnls.len() as i64;
            let profitable_trades = pnls.iter().filter(|p| **p > 0.0).count() as i64;
            let total_pnl: f64 = pnls.iter().sum();
            let win_rate = if total_trades > 0 {
                profitable_trades as f64 / total_trades as f64 * 100.0
            } else {
                0.0
            };
            let (best_trade, worst_trade) = best_worst_trade(&pnls);
            let date_str = date.format("%Y-%m-%d").to_string();

            conn.execute(
                "INSERT INTO daily_stats (date, total_trades, profitable_trades, total_pnl, win_rate, best_trade, worst_trade) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7) \
                 ON CONFLICT(date) DO UPDATE SET total_trades=excluded.total_trades, profitable_trades=excluded.profitable_trades, \
                 total_pnl=excluded.total_pnl, win_rate=excluded.win_rate, best_trade=excluded.best_trade, worst_trade=excluded.worst_trade",
                params![date_str, total_trades, profitable_trades, total_pnl, win_rate, best_trade, worst_trade],
            )?;

            Ok(DailyStats {
                date: date_str,
                total_trades,
                profitable_trades,
                total_pnl,
                win_rate,
                best_trade,
                worst_trade,
            })
        })
        .await?
    }

    #[instrument(skip(self))]
    pub async fn get_order_by_exchange_id(&self, order_id: String) -> anyhow::Result<Option<OrderRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.query_row("SELECT * FROM orders WHERE order_id = ?1", params![order_id], row_to_order)
                .optional()
                .map_err(anyhow::Error::from)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn scratch_store() -> Store {
        let mut path = std::env::temp_dir();
        path.push(format!("correlate_bot_store_test_{}.db", uuid::Uuid::new_v4()));
        Store::open(path).unwrap()
    }

    #[tokio::test]
    async fn saves_and_retrieves_open_orders() {
        let store = scratch_store();
        let order = OrderRecord::new_open(
            "WIFUSDT".to_string(),
            "WIFUSDT".to_string(),
            "ex-1".to_string(),
            Side::Buy,
            240.0,
            0.415,
            Some(0.417),
            Some(0.413),
        );
        let id = store.save_order(order).await.unwrap();
        let open = store.get_open_orders(None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, Some(id));
        assert_eq!(open[0].status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn update_order_transitions_to_closed() {
        let store = scratch_store();
        let order = OrderRecord::new_open(
            "WIFUSDT".to_string(),
            "WIFUSDT".to_string(),
            "ex-2".to_string(),
            Side::Buy,
            240.0,
            0.415,
            Some(0.417),
            Some(0.413),
        );
        let id = store.save_order(order).await.unwrap();
        store
            .update_order(
                id,
                OrderUpdate {
                    status: Some(OrderStatus::Closed),
                    closed_at: Some(Utc::now()),
                    close_price: Some(0.417),
                    pnl: Some(0.48),
                    pnl_percent: Some(0.48),
                    close_reason: Some(CloseReason::Tp),
                },
            )
            .await
            .unwrap();
        let open = store.get_open_orders(None).await.unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn daily_stats_roundtrip_is_idempotent() {
        let store = scratch_store();
        let stats1 = store.calculate_and_save_daily_stats(None).await.unwrap();
        let stats2 = store.calculate_and_save_daily_stats(None).await.unwrap();
        assert_eq!(stats1.date, stats2.date);
        assert_eq!(stats1.total_trades, 0);
    }
}
