//! Row types persisted by the Durable Store. Field sets ported from
//! `src/storage/models.py` (`OrderRecord`, `SignalRecord`, `DailyStats`).

use chrono::{DateTime, Utc};

use crate::types::{CloseReason, OrderStatus, Side};

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub id: Option<i64>,
    pub pair_name: String,
    pub symbol: String,
    pub order_id: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: OrderStatus,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn new_open(
        pair_name: String,
        symbol: String,
        order_id: String,
        side: Side,
        quantity: f64,
        entry_price: f64,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        OrderRecord {
            id: None,
            pair_name,
            symbol,
            order_id,
            side,
            quantity,
            entry_price,
            take_profit,
            stop_loss,
            status: OrderStatus::Open,
            opened_at: Some(now),
            closed_at: None,
            close_price: None,
            pnl: None,
            pnl_percent: None,
            close_reason: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub id: Option<i64>,
    pub pair_name: String,
    pub action: String,
    pub dominant_change: f64,
    pub target_change: f64,
    pub target_price: f64,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn new(pair_name: String, action: String, dominant_change: f64, target_change: f64, target_price: f64) -> Self {
        SignalRecord {
            id: None,
            pair_name,
            action,
            dominant_change,
            target_change,
            target_price,
            executed: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DailyStats {
    pub date: String,
    pub total_trades: i64,
    pub profitable_trades: i64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StatisticsSummary {
    pub period_days: i64,
    pub total_trades: i64,
    pub profitable_trades: i64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
}
