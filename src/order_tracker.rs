//! Order Tracker: a 5s-cadence background poller holding
//! `exchangeOrderId -> OrderRecord` for every order currently open. Grounded
//! in `src/trading/order_tracker.py`'s `_check_order_status`/`untrack_order`
//! loop; the close-reason inference there compares `close_price` against
//! `take_profit`/`stop_loss` without branching on side (a bug for Sell
//! orders, where the brackets are inverted) — fixed here by delegating to
//! the Position Coordinator's side-aware `finalize_close`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::position::PositionCoordinator;
use crate::store::models::OrderRecord;
use crate::types::Category;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const HISTORY_LIMIT: u32 = 50;

pub struct OrderTracker {
    client: Arc<ExchangeClient>,
    coordinator: Arc<PositionCoordinator>,
    tracked: RwLock<HashMap<String, OrderRecord>>,
}

impl OrderTracker {
    pub fn new(client: Arc<ExchangeClient>, coordinator: Arc<PositionCoordinator>) -> Arc<Self> {
        Arc::new(OrderTracker {
            client,
            coordinator,
            tracked: RwLock::new(HashMap::new()),
        })
    }

    /// Inserted by the coordinator on a successful open, and during
    /// startup recovery of every OPEN order from the Durable Store (I2).
    pub fn track_order(&self, order: OrderRecord) {
        self.tracked.write().insert(order.order_id.clone(), order);
    }

    pub fn untrack_order(&self, exchange_order_id: &str) {
        self.tracked.write().remove(exchange_order_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.read().len()
    }

    /// One poll cycle: group tracked orders by symbol, fetch history per
    /// symbol, apply terminal transitions, and untrack anything terminal.
    async fn poll_once(&self) {
        let by_symbol: HashMap<String, Vec<OrderRecord>> = {
            let tracked = self.tracked.read();
            let mut grouped: HashMap<String, Vec<OrderRecord>> = HashMap::new();
            for order in tracked.values() {
                grouped.entry(order.symbol.clone()).or_default().push(order.clone());
            }
            grouped
        };

        for (symbol, orders) in by_symbol {
            let history = self.client.get_order_history(Category::Linear, Some(&symbol), HISTORY_LIMIT).await;
            for order in orders {
                let Some(hist) = history.iter().find(|h| h.order_id == order.order_id) else {
                    continue;
                };
                match hist.order_status.as_str() {
                    "Filled" => {
                        // ReconciliationUnknown (§7): a fill with no usable
                        // average price can't be reconciled against TP/SL
                        // levels, so don't guess a reason from a stale price.
                        let (close_price, close_reason) = if hist.avg_price > 0.0 {
                            (hist.avg_price, crate::position::infer_close_reason(&order, hist.avg_price))
                        } else {
                            warn!(order_id = %order.order_id, symbol, "fill reported with no usable average price");
                            (order.entry_price, crate::types::CloseReason::Unknown)
                        };
                        self.coordinator
                            .finalize_close(&order.pair_name, &order, close_price, close_reason)
                            .await;
                        info!(order_id = %order.order_id, symbol, "order filled, untracking");
                        self.untrack_order(&order.order_id);
                    }
                    "Cancelled" => {
                        self.coordinator.finalize_cancelled(&order.pair_name, &order).await;
                        info!(order_id = %order.order_id, symbol, "order cancelled, untracking");
                        self.untrack_order(&order.order_id);
                    }
                    _ => {}
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::store::Store;
    use crate::types::Side;

    fn scratch_store() -> Arc<Store> {
        let mut path = std::env::temp_dir();
        path.push(format!("correlate_bot_tracker_test_{}.db", uuid::Uuid::new_v4()));
        Arc::new(Store::open(path).unwrap())
    }

    #[tokio::test]
    async fn track_and_untrack_round_trip() {
        let client = Arc::new(ExchangeClient::new("k".into(), "s".into(), true).unwrap());
        let store = scratch_store();
        let notifier = Arc::new(Notifier::new(crate::config::TelegramConfig::default()));
        let coordinator = PositionCoordinator::new(client.clone(), store, notifier, 3);
        let tracker = OrderTracker::new(client, coordinator);

        let order = OrderRecord::new_open("alpha".into(), "WIFUSDT".into(), "ex-9".into(), Side::Buy, 240.0, 0.415, Some(0.417), Some(0.413));
        tracker.track_order(order);
        assert_eq!(tracker.tracked_count(), 1);
        tracker.untrack_order("ex-9");
        assert_eq!(tracker.tracked_count(), 0);
    }
}
