//! Statistics / Reporting: rolling aggregates over the Durable Store plus a
//! once-per-day digest, idempotent across restarts via a single-line state
//! file. Grounded in `src/monitoring/statistics.py::StatisticsMonitor`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Timelike, Utc};
use tracing::{error, warn};

use crate::store::models::StatisticsSummary;
use crate::store::Store;

const DAILY_REPORT_STATE_VAR: &str = "STATISTICS_DAILYREPORT_STATE";
const DEFAULT_STATE_PATH: &str = ".daily_report_sent";
/// The daily-report window: checked once per minute by the main loop, a
/// report is sent exactly once within the first 10 minutes past midnight.
const REPORT_WINDOW_MINUTES: u32 = 10;

pub struct StatisticsMonitor {
    store: Arc<Store>,
    state_path: PathBuf,
}

impl StatisticsMonitor {
    pub fn new(store: Arc<Store>) -> Self {
        let state_path = std::env::var(DAILY_REPORT_STATE_VAR)
            .unwrap_or_else(|_| DEFAULT_STATE_PATH.to_string())
            .into();
        StatisticsMonitor { store, state_path }
    }

    pub async fn today(&self) -> anyhow::Result<StatisticsSummary> {
        self.store.get_statistics_summary(1).await
    }

    pub async fn week(&self) -> anyhow::Result<StatisticsSummary> {
        self.store.get_statistics_summary(7).await
    }

    pub async fn month(&self) -> anyhow::Result<StatisticsSummary> {
        self.store.get_statistics_summary(30).await
    }

    pub fn format_report(today: &StatisticsSummary, week: &StatisticsSummary, month: &StatisticsSummary) -> String {
        format!(
            "Today: {} trades, {:.2} USDT ({:.1}% win rate)\n\
             7d:    {} trades, {:.2} USDT ({:.1}% win rate)\n\
             30d:   {} trades, {:.2} USDT ({:.1}% win rate)",
            today.total_trades, today.total_pnl, today.win_rate,
            week.total_trades, week.total_pnl, week.win_rate,
            month.total_trades, month.total_pnl, month.win_rate,
        )
    }

    fn last_reported_date(&self) -> Option<NaiveDate> {
        let raw = std::fs::read_to_string(&self.state_path).ok()?;
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
    }

    fn mark_reported(&self, date: NaiveDate) {
        if let Err(e) = std::fs::write(&self.state_path, date.format("%Y-%m-%d").to_string()) {
            warn!(%e, "failed to persist daily-report state file");
        }
    }

    /// Called roughly once per minute by the main loop. Returns a formatted
    /// report exactly once per calendar day, only inside the 00:00-00:10
    /// window, surviving process restarts via the state file.
    pub async fn maybe_due_report(&self) -> Option<String> {
        let now = Utc::now();
        if now.hour() != 0 || now.minute() >= REPORT_WINDOW_MINUTES {
            return None;
        }
        let today = now.date_naive();
        if self.last_reported_date() == Some(today) {
            return None;
        }

        let summaries = match (self.today().await, self.week().await, self.month().await) {
            (Ok(t), Ok(w), Ok(m)) => (t, w, m),
            (t, w, m) => {
                error!(?t, ?w, ?m, "failed to compute daily report summaries");
                return None;
            }
        };
        if let Err(e) = self.store.calculate_and_save_daily_stats(Some(today)).await {
            error!(%e, "failed to persist daily stats rollup");
        }
        self.mark_reported(today);
        Some(Self::format_report(&summaries.0, &summaries.1, &summaries.2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::OrderRecord;
    use crate::types::Side;

    fn scratch_store() -> Arc<Store> {
        let mut path = std::env::temp_dir();
        path.push(format!("correlate_bot_stats_test_{}.db", uuid::Uuid::new_v4()));
        Arc::new(Store::open(path).unwrap())
    }

    #[tokio::test]
    async fn summaries_reflect_closed_orders() {
        let store = scratch_store();
        let monitor = StatisticsMonitor::new(store.clone());
        let order = OrderRecord::new_open("alpha".into(), "WIFUSDT".into(), "ex-1".into(), Side::Buy, 240.0, 0.415, Some(0.417), Some(0.413));
        let id = store.save_order(order).await.unwrap();
        store
            .update_order(
                id,
                crate::store::OrderUpdate {
                    status: Some(crate::types::OrderStatus::Closed),
                    closed_at: Some(Utc::now()),
                    close_price: Some(0.417),
                    pnl: Some(0.48),
                    pnl_percent: Some(0.48),
                    close_reason: Some(crate::types::CloseReason::Tp),
                },
            )
            .await
            .unwrap();
        let today = monitor.today().await.unwrap();
        assert_eq!(today.total_trades, 1);
        assert_eq!(today.profitable_trades, 1);
    }

    #[test]
    fn format_report_includes_all_three_windows() {
        let summary = StatisticsSummary { period_days: 1, total_trades: 2, profitable_trades: 1, total_pnl: 5.0, win_rate: 50.0, best_trade: 4.0, worst_trade: -1.0 };
        let text = StatisticsMonitor::format_report(&summary, &summary, &summary);
        assert!(text.contains("Today"));
        assert!(text.contains("7d"));
        assert!(text.contains("30d"));
    }
}
