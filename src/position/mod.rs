//! Position Lifecycle Coordinator: the only component allowed to mutate
//! `openPositions`. Owns the open-flow (`execute_multi_signal`) and
//! close-flow (`check_positions`) contracts, the normalization hand-off to
//! §4.1, and the consecutive-stop-loss circuit breaker. Grounded in
//! `position_engine.rs`'s state-machine shape and `reconcile.rs`'s
//! exchange-reconciliation loop, re-targeted at the signal-driven
//! open/close contract named in the specification; the non-side-aware
//! close-reason comparison in the original implementation's
//! `order_tracker.py` (`>=`/`<=` without branching on side) is replaced
//! here with the side-aware inference spec'd in the redesign notes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::config::StrategyConfig;
use crate::exchange::{normalize_order, ExchangeClient, InstrumentCache};
use crate::notify::Notifier;
use crate::store::models::{OrderRecord, SignalRecord};
use crate::store::{OrderUpdate, Store};
use crate::strategy::SignalResult;
use crate::types::{CloseReason, OrderStatus, Side};

/// 24h window after which the consecutive-stop-loss streak auto-resets.
const STREAK_RESET_WINDOW: chrono::Duration = chrono::Duration::hours(24);

struct StreakState {
    consecutive_stop_losses: u32,
    last_stop_loss_at: Option<chrono::DateTime<Utc>>,
}

impl StreakState {
    fn new() -> Self {
        StreakState {
            consecutive_stop_losses: 0,
            last_stop_loss_at: None,
        }
    }

    fn auto_reset(&mut self) {
        if let Some(last) = self.last_stop_loss_at {
            if Utc::now() - last > STREAK_RESET_WINDOW {
                self.consecutive_stop_losses = 0;
                self.last_stop_loss_at = None;
            }
        }
    }

    fn update(&mut self, increment: bool) {
        if increment {
            self.consecutive_stop_losses += 1;
            self.last_stop_loss_at = Some(Utc::now());
        } else {
            self.consecutive_stop_losses = 0;
        }
    }
}

/// Coordinates position open/close across every configured strategy.
/// At most one open position per strategy name (I1).
pub struct PositionCoordinator {
    client: Arc<ExchangeClient>,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    instruments: InstrumentCache,
    max_stop_loss_trades: u32,
    open_positions: RwLock<HashMap<String, OrderRecord>>,
    position_categories: RwLock<HashMap<String, crate::types::Category>>,
    streaks: RwLock<HashMap<String, StreakState>>,
    total_trades: std::sync::atomic::AtomicU64,
}

impl PositionCoordinator {
    pub fn new(client: Arc<ExchangeClient>, store: Arc<Store>, notifier: Arc<Notifier>, max_stop_loss_trades: u32) -> Arc<Self> {
        Arc::new(PositionCoordinator {
            client,
            store,
            notifier,
            instruments: InstrumentCache::new(),
            max_stop_loss_trades,
            open_positions: RwLock::new(HashMap::new()),
            position_categories: RwLock::new(HashMap::new()),
            streaks: RwLock::new(HashMap::new()),
            total_trades: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Restores `openPositions` from the Durable Store's OPEN orders on
    /// startup (I2). The caller is also responsible for handing the same
    /// set to the Order Tracker. `strategies` resolves each restored
    /// order's market category by its owning strategy's configuration.
    pub async fn restore_open_positions(
        &self,
        strategies: &HashMap<String, StrategyConfig>,
    ) -> anyhow::Result<Vec<OrderRecord>> {
        let open = self.store.get_open_orders(None).await?;
        let mut positions = self.open_positions.write();
        let mut categories = self.position_categories.write();
        for order in &open {
            positions.insert(order.pair_name.clone(), order.clone());
            let category = strategies
                .get(&order.pair_name)
                .map(|s| s.category_for(&order.symbol))
                .unwrap_or(crate::types::Category::Linear);
            categories.insert(order.pair_name.clone(), category);
        }
        Ok(open)
    }

    pub fn has_open_position(&self, strategy_name: &str) -> bool {
        self.open_positions.read().contains_key(strategy_name)
    }

    fn auto_reset_streak(&self, strategy_name: &str) {
        self.streaks
            .write()
            .entry(strategy_name.to_string())
            .or_insert_with(StreakState::new)
            .auto_reset();
    }

    /// Open-flow contract (§4.4): `executeMultiSignal`.
    pub async fn execute_multi_signal(&self, strategy: &StrategyConfig, signal: SignalResult) {
        self.auto_reset_streak(&strategy.name);

        let signal_record = SignalRecord::new(
            strategy.name.clone(),
            signal.action.to_string().to_uppercase(),
            signal.index_change,
            signal.target_change,
            signal.entry_reference_price,
        );
        let signal_id = match self.store.save_signal(signal_record).await {
            Ok(id) => id,
            Err(e) => {
                error!(%e, strategy = %strategy.name, "failed to persist signal record");
                return;
            }
        };

        self.notifier.notify_signal(&strategy.name, &signal.trade_pair, signal.action, signal.index_change);

        if !signal.slippage_ok {
            warn!(strategy = %strategy.name, "refusing open: slippage check failed");
            return;
        }

        let streak_exceeded = {
            let streaks = self.streaks.read();
            streaks
                .get(&strategy.name)
                .map(|s| s.consecutive_stop_losses >= self.max_stop_loss_trades)
                .unwrap_or(false)
        };
        if streak_exceeded {
            warn!(strategy = %strategy.name, "refusing open: consecutive stop-loss cap reached");
            self.notifier.notify_error(&format!(
                "strategy '{}' paused: {} consecutive stop losses",
                strategy.name, self.max_stop_loss_trades
            ));
            return;
        }

        if self.has_open_position(&strategy.name) {
            warn!(strategy = %strategy.name, "refusing open: position already open");
            return;
        }

        let category = strategy.category_for(&signal.trade_pair);
        let balance = self.client.get_wallet_balance("UNIFIED").await;
        let equity = balance.map(|b| b.total_equity).unwrap_or(0.0);
        if equity <= 0.0 {
            warn!(strategy = %strategy.name, "refusing open: non-positive wallet balance");
            return;
        }

        let notional = strategy.position_size;
        if notional < 5.0 {
            warn!(strategy = %strategy.name, notional, "refusing open: position size below exchange minimum");
            return;
        }

        let trade_pair = signal.trade_pair.clone();
        let last_price = signal.entry_reference_price;
        if last_price <= 0.0 {
            warn!(strategy = %strategy.name, "refusing open: no reference price available");
            return;
        }

        let (take_profit, stop_loss) = match signal.action {
            Side::Buy => (
                last_price * (1.0 + strategy.stop_take_percent),
                last_price * (1.0 - strategy.stop_take_percent),
            ),
            Side::Sell => (
                last_price * (1.0 - strategy.stop_take_percent),
                last_price * (1.0 + strategy.stop_take_percent),
            ),
        };

        let spec = self.instruments.get(&self.client, category, &trade_pair).await;
        let normalized = match normalize_order(signal.action, last_price, notional, take_profit, stop_loss, &spec) {
            Ok(n) => n,
            Err(e) => {
                warn!(%e, strategy = %strategy.name, "refusing open: normalization failed");
                return;
            }
        };

        self.client.set_leverage(category, &trade_pair, strategy.leverage).await;

        let placed = self
            .client
            .place_market_order(
                category,
                &trade_pair,
                signal.action,
                &normalized.qty,
                &normalized.take_profit,
                &normalized.stop_loss,
                0,
            )
            .await;
        let Some(placed) = placed else {
            warn!(strategy = %strategy.name, "refusing open: order placement failed");
            return;
        };

        let order = OrderRecord::new_open(
            strategy.name.clone(),
            trade_pair.clone(),
            placed.order_id.clone(),
            signal.action,
            normalized.qty_value,
            last_price,
            Some(take_profit),
            Some(stop_loss),
        );
        let order_id = match self.store.save_order(order.clone()).await {
            Ok(id) => id,
            Err(e) => {
                error!(%e, strategy = %strategy.name, "failed to persist opened order");
                return;
            }
        };
        let mut order = order;
        order.id = Some(order_id);

        self.open_positions.write().insert(strategy.name.clone(), order.clone());
        self.position_categories.write().insert(strategy.name.clone(), category);
        if let Err(e) = self.store.mark_signal_executed(signal_id).await {
            error!(%e, strategy = %strategy.name, "failed to mark signal executed");
        }
        self.total_trades.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.notifier.notify_trade_opened(&strategy.name, &trade_pair, signal.action, normalized.qty_value, last_price);
        info!(strategy = %strategy.name, pair = %trade_pair, side = %signal.action, "position opened");
    }

    /// Close-flow contract (§4.4): `checkPositions`, polled by the main loop.
    /// Detects externally-closed positions by polling `getPosition`, then
    /// reconciles against order history.
    pub async fn check_positions(&self) {
        let tracked: Vec<(String, OrderRecord)> =
            self.open_positions.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        for (strategy_name, order) in tracked {
            let category = self
                .position_categories
                .read()
                .get(&strategy_name)
                .copied()
                .unwrap_or(crate::types::Category::Linear);
            let position = self.client.get_position(category, &order.symbol).await;
            let still_open = position.map(|p| p.size > 0.0).unwrap_or(false);
            if still_open {
                continue;
            }

            let history = self.client.get_order_history(category, Some(&order.symbol), 10).await;
            let matched = history.iter().find(|h| h.order_id == order.order_id);
            let (close_price, close_reason) = match matched {
                Some(hist) => {
                    let close_price = hist.avg_price;
                    (close_price, infer_close_reason(&order, close_price))
                }
                None => {
                    // ReconciliationUnknown (§7): the position closed but no
                    // matching order-history record surfaced. Use the last
                    // known price and record the close as unreconciled rather
                    // than guessing a TP/SL/Manual reason from a stale price.
                    warn!(
                        strategy = %strategy_name,
                        pair = %order.symbol,
                        order_id = %order.order_id,
                        "close detected with no matching order-history record"
                    );
                    (order.entry_price, CloseReason::Unknown)
                }
            };
            self.finalize_close(&strategy_name, &order, close_price, close_reason).await;
        }
    }

    /// Applies a terminal close detected by another component (the Order
    /// Tracker) to `openPositions`, the Durable Store, and the streak
    /// breaker — the single place close bookkeeping happens, so the two
    /// close-detection paths in §4.4/§4.5 never diverge.
    pub async fn finalize_close(&self, strategy_name: &str, order: &OrderRecord, close_price: f64, close_reason: CloseReason) {
        let pnl = match order.side {
            Side::Buy => (close_price - order.entry_price) * order.quantity,
            Side::Sell => (order.entry_price - close_price) * order.quantity,
        };
        let denom = order.entry_price * order.quantity;
        let pnl_percent = if denom != 0.0 { pnl / denom * 100.0 } else { 0.0 };

        if let Some(id) = order.id {
            let _ = self
                .store
                .update_order(
                    id,
                    OrderUpdate {
                        status: Some(OrderStatus::Closed),
                        closed_at: Some(Utc::now()),
                        close_price: Some(close_price),
                        pnl: Some(pnl),
                        pnl_percent: Some(pnl_percent),
                        close_reason: Some(close_reason),
                    },
                )
                .await;
        }
        self.open_positions.write().remove(strategy_name);
        self.position_categories.write().remove(strategy_name);

        let mut streaks = self.streaks.write();
        let streak = streaks.entry(strategy_name.to_string()).or_insert_with(StreakState::new);
        if pnl > 0.0 {
            streak.update(false);
        } else if close_reason == CloseReason::Sl {
            streak.update(true);
        }
        drop(streaks);

        self.notifier.notify_trade_closed(strategy_name, &order.symbol, close_reason, pnl, pnl_percent);
        info!(strategy = %strategy_name, pair = %order.symbol, %close_reason, pnl, "position closed");
    }

    /// Cancellation transition: no P&L, no streak update.
    pub async fn finalize_cancelled(&self, strategy_name: &str, order: &OrderRecord) {
        if let Some(id) = order.id {
            let _ = self
                .store
                .update_order(
                    id,
                    OrderUpdate {
                        status: Some(OrderStatus::Cancelled),
                        closed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
        }
        self.open_positions.write().remove(strategy_name);
        self.position_categories.write().remove(strategy_name);
        info!(strategy = %strategy_name, pair = %order.symbol, "order cancelled");
    }

    pub fn total_trades(&self) -> u64 {
        self.total_trades.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.read().len()
    }

    /// Drains signals from every strategy's emit channel and routes them
    /// through `execute_multi_signal`. One task per strategy, spawned by
    /// main.rs.
    pub async fn run(
        self: Arc<Self>,
        strategy: Arc<StrategyConfig>,
        mut rx: UnboundedReceiver<SignalResult>,
    ) {
        while let Some(signal) = rx.recv().await {
            self.execute_multi_signal(&strategy, signal).await;
        }
    }

    /// Cadence used by the main loop for `check_positions` polling.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
}

/// Side-aware close-reason inference (redesigned vs. the non-side-aware
/// `>=`/`<=` comparison in the legacy implementation): Buy crossing its TP
/// upward or Sell crossing its TP downward is TP; the opposite-direction
/// crossing of the stop level is SL; anything else is MANUAL.
pub(crate) fn infer_close_reason(order: &OrderRecord, close_price: f64) -> CloseReason {
    let Some(take_profit) = order.take_profit else {
        return CloseReason::Manual;
    };
    let Some(stop_loss) = order.stop_loss else {
        return CloseReason::Manual;
    };
    match order.side {
        Side::Buy => {
            if close_price >= take_profit {
                CloseReason::Tp
            } else if close_price <= stop_loss {
                CloseReason::Sl
            } else {
                CloseReason::Manual
            }
        }
        Side::Sell => {
            if close_price <= take_profit {
                CloseReason::Tp
            } else if close_price >= stop_loss {
                CloseReason::Sl
            } else {
                CloseReason::Manual
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_with(side: Side, entry: f64, tp: f64, sl: f64) -> OrderRecord {
        OrderRecord::new_open("alpha".into(), "WIFUSDT".into(), "ex-1".into(), side, 100.0, entry, Some(tp), Some(sl))
    }

    #[test]
    fn buy_close_reason_is_side_aware() {
        let order = order_with(Side::Buy, 0.415, 0.417, 0.413);
        assert_eq!(infer_close_reason(&order, 0.418), CloseReason::Tp);
        assert_eq!(infer_close_reason(&order, 0.412), CloseReason::Sl);
        assert_eq!(infer_close_reason(&order, 0.415), CloseReason::Manual);
    }

    #[test]
    fn sell_close_reason_is_side_aware() {
        let order = order_with(Side::Sell, 157.09, 156.46, 157.72);
        assert_eq!(infer_close_reason(&order, 156.0), CloseReason::Tp);
        assert_eq!(infer_close_reason(&order, 158.0), CloseReason::Sl);
        assert_eq!(infer_close_reason(&order, 157.0), CloseReason::Manual);
    }

    #[test]
    fn streak_auto_resets_after_24h() {
        let mut streak = StreakState::new();
        streak.update(true);
        streak.update(true);
        assert_eq!(streak.consecutive_stop_losses, 2);
        streak.last_stop_loss_at = Some(Utc::now() - chrono::Duration::hours(25));
        streak.auto_reset();
        assert_eq!(streak.consecutive_stop_losses, 0);
    }

    #[test]
    fn streak_resets_on_profitable_close() {
        let mut streak = StreakState::new();
        streak.update(true);
        streak.update(false);
        assert_eq!(streak.consecutive_stop_losses, 0);
    }
}
