//! Market-Data Fan-Out: deduplicates (symbol, timeframe, category)
//! subscriptions across strategies, owns exactly one transport per key
//! (WebSocket for minute-or-larger frames, REST polling for sub-minute
//! frames), and delivers confirmed bars to subscribers in per-key FIFO
//! order. Grounded in `src/api/global_market_data_manager.py`'s
//! subscription multimap and `market_data/candle_buffer.rs`'s
//! connect/reconnect loop shape; message-passing delivery follows the
//! explicit per-strategy-channel design note (spec §9) rather than the
//! original's stored-callback-list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::StrategyConfig;
use crate::exchange::{self, ExchangeClient};
use crate::types::{Bar, Category, Timeframe};

const SILENCE_TIMEOUT: Duration = Duration::from_secs(70);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BACKOFF: Duration = Duration::from_secs(5);
const WATCHDOG_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub category: Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceType {
    Websocket,
    Polling,
}

/// A confirmed bar, tagged with the key it arrived on so a strategy can
/// route it to the matching signal buffers.
#[derive(Debug, Clone)]
pub struct FanoutMessage {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub category: Category,
    pub bar: Bar,
}

struct Subscriber {
    strategy_name: String,
    source_type: SourceType,
    sender: UnboundedSender<FanoutMessage>,
}

pub struct FanOut {
    client: Arc<ExchangeClient>,
    subscriptions: RwLock<HashMap<SubscriptionKey, Vec<Subscriber>>>,
    registered_strategies: RwLock<HashSet<String>>,
    last_bar_at: RwLock<HashMap<SubscriptionKey, Instant>>,
    ws_tasks: RwLock<HashMap<SubscriptionKey, JoinHandle<()>>>,
    polling_tasks: RwLock<HashMap<(Timeframe, Category), JoinHandle<()>>>,
}

impl FanOut {
    pub fn new(client: Arc<ExchangeClient>) -> Arc<Self> {
        Arc::new(FanOut {
            client,
            subscriptions: RwLock::new(HashMap::new()),
            registered_strategies: RwLock::new(HashSet::new()),
            last_bar_at: RwLock::new(HashMap::new()),
            ws_tasks: RwLock::new(HashMap::new()),
            polling_tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Idempotent per strategy name: re-registering the same strategy is a
    /// no-op.
    pub fn register(&self, strategy: &StrategyConfig, sender: UnboundedSender<FanoutMessage>) {
        if !self.registered_strategies.write().insert(strategy.name.clone()) {
            return;
        }
        let mut subs = self.subscriptions.write();
        for signal in strategy.signals.values() {
            let mut symbols: Vec<&str> = vec![signal.index.as_str()];
            symbols.extend(strategy.trade_pairs.iter().map(|s| s.as_str()));
            let source_type = if signal.frame.uses_polling() {
                SourceType::Polling
            } else {
                SourceType::Websocket
            };
            for symbol in symbols {
                let category = strategy.category_for(symbol);
                let key = SubscriptionKey {
                    symbol: symbol.to_string(),
                    timeframe: signal.frame,
                    category,
                };
                subs.entry(key).or_default().push(Subscriber {
                    strategy_name: strategy.name.clone(),
                    source_type,
                    sender: sender.clone(),
                });
            }
        }
    }

    pub fn unregister(&self, strategy_name: &str) {
        self.registered_strategies.write().remove(strategy_name);
        let mut now_empty = Vec::new();
        {
            let mut subs = self.subscriptions.write();
            for (key, list) in subs.iter_mut() {
                list.retain(|s| s.strategy_name != strategy_name);
                if list.is_empty() {
                    now_empty.push(key.clone());
                }
            }
            for key in &now_empty {
                subs.remove(key);
            }
        }
        for key in now_empty {
            self.teardown_key(&key);
        }
    }

    fn teardown_key(&self, key: &SubscriptionKey) {
        if let Some(handle) = self.ws_tasks.write().remove(key) {
            handle.abort();
        }
        self.last_bar_at.write().remove(key);
    }

    /// Opens every distinct subscription exactly once: one WebSocket
    /// supervisor per WS key, one polling task per (timeframe, category)
    /// group containing at least one polling subscriber.
    pub fn activate(self: &Arc<Self>) {
        let keys: Vec<SubscriptionKey> = self.subscriptions.read().keys().cloned().collect();
        for key in &keys {
            let has_ws = self
                .subscriptions
                .read()
                .get(key)
                .map(|l| l.iter().any(|s| s.source_type == SourceType::Websocket))
                .unwrap_or(false);
            if has_ws && !self.ws_tasks.read().contains_key(key) {
                let fanout = Arc::clone(self);
                let spawn_key = key.clone();
                let handle = tokio::spawn(async move { fanout.supervise_ws(spawn_key).await });
                self.ws_tasks.write().insert(key.clone(), handle);
            }
        }

        let mut polling_groups: HashSet<(Timeframe, Category)> = HashSet::new();
        for (key, list) in self.subscriptions.read().iter() {
            if list.iter().any(|s| s.source_type == SourceType::Polling) {
                polling_groups.insert((key.timeframe, key.category));
            }
        }
        for group in polling_groups {
            if !self.polling_tasks.read().contains_key(&group) {
                let fanout = Arc::clone(self);
                let handle = tokio::spawn(async move { fanout.run_polling_group(group.0, group.1).await });
                self.polling_tasks.write().insert(group, handle);
            }
        }
    }

    pub fn stop(&self) {
        for (_, handle) in self.ws_tasks.write().drain() {
            handle.abort();
        }
        for (_, handle) in self.polling_tasks.write().drain() {
            handle.abort();
        }
    }

    async fn supervise_ws(self: Arc<Self>, key: SubscriptionKey) {
        let mut attempts = 0u32;
        loop {
            if !self.subscriptions.read().contains_key(&key) {
                return;
            }
            self.last_bar_at.write().insert(key.clone(), Instant::now());

            let fanout = Arc::clone(&self);
            let bar_key = key.clone();
            let stream_fut =
                exchange::ws::stream_kline(key.category, &key.symbol, &key.timeframe.wire(), move |bar| {
                    fanout.deliver(&bar_key, bar);
                });
            let watchdog_fut = self.clone().watchdog(key.clone());

            tokio::select! {
                res = stream_fut => {
                    if let Err(e) = res {
                        warn!(?key, %e, "ws stream ended with error");
                    } else {
                        debug!(?key, "ws stream closed");
                    }
                }
                _ = watchdog_fut => {
                    warn!(?key, "no bar observed for > 70s, forcing reconnect");
                }
            }

            attempts += 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                error!(?key, attempts, "giving up after max reconnect attempts");
                return;
            }
            if !self.subscriptions.read().contains_key(&key) {
                return;
            }
            tokio::time::sleep(BACKOFF).await;
        }
    }

    async fn watchdog(self: Arc<Self>, key: SubscriptionKey) {
        loop {
            tokio::time::sleep(WATCHDOG_POLL).await;
            let elapsed = self
                .last_bar_at
                .read()
                .get(&key)
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if elapsed > SILENCE_TIMEOUT {
                return;
            }
        }
    }

    async fn run_polling_group(self: Arc<Self>, timeframe: Timeframe, category: Category) {
        let period = Duration::from_secs(timeframe.as_seconds().max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let symbols: Vec<String> = {
                let subs = self.subscriptions.read();
                subs.iter()
                    .filter(|(k, list)| {
                        k.timeframe == timeframe
                            && k.category == category
                            && list.iter().any(|s| s.source_type == SourceType::Polling)
                    })
                    .map(|(k, _)| k.symbol.clone())
                    .collect()
            };
            if symbols.is_empty() {
                return;
            }
            for symbol in symbols {
                if let Some(ticker) = self.client.get_ticker(category, &symbol).await {
                    let bar = Bar {
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        open: ticker.last_price,
                        high: ticker.last_price,
                        low: ticker.last_price,
                        close: ticker.last_price,
                        volume: ticker.volume_24h,
                        confirmed: true,
                    };
                    let key = SubscriptionKey {
                        symbol: symbol.clone(),
                        timeframe,
                        category,
                    };
                    self.deliver(&key, bar);
                }
            }
        }
    }

    /// Delivers a confirmed bar to every subscriber of `key`, in the order
    /// this function is called (per-key FIFO). A subscriber whose channel
    /// has closed is logged and skipped; it never blocks other subscribers.
    fn deliver(&self, key: &SubscriptionKey, bar: Bar) {
        if !bar.confirmed {
            return;
        }
        self.last_bar_at.write().insert(key.clone(), Instant::now());
        let subs = self.subscriptions.read();
        if let Some(list) = subs.get(key) {
            for sub in list {
                let msg = FanoutMessage {
                    symbol: key.symbol.clone(),
                    timeframe: key.timeframe,
                    category: key.category,
                    bar,
                };
                if sub.sender.send(msg).is_err() {
                    warn!(strategy = %sub.strategy_name, ?key, "subscriber channel closed, dropping bar");
                }
            }
        }
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    #[cfg(test)]
    fn subscribers_for(&self, key: &SubscriptionKey) -> usize {
        self.subscriptions.read().get(key).map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SignalConfig, StrategyConfig};
    use crate::types::Direction;
    use std::collections::HashMap as Map;

    fn dummy_client() -> Arc<ExchangeClient> {
        Arc::new(ExchangeClient::new("k".into(), "s".into(), true).unwrap())
    }

    fn strategy_with(name: &str, index: &str, frame: &str, trade_pairs: Vec<&str>) -> StrategyConfig {
        let mut signals = Map::new();
        signals.insert(
            "s1".to_string(),
            SignalConfig {
                index: index.to_string(),
                frame: Timeframe::parse(frame).unwrap(),
                tick_window: 5,
                index_change_threshold: 1.0,
                target: 0.8,
                direction: Direction::Any,
                reverse: false,
            },
        );
        StrategyConfig {
            name: name.to_string(),
            trade_pairs: trade_pairs.into_iter().map(String::from).collect(),
            leverage: 5,
            tick_window: 5,
            price_change_threshold: 0.5,
            stop_take_percent: 0.01,
            position_size: 100.0,
            direction: Direction::Any,
            signals,
            enabled: true,
        }
    }

    #[test]
    fn dedups_identical_subscriptions_across_strategies() {
        let fanout = FanOut::new(dummy_client());
        let (tx_a, _rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, _rx_b) = tokio::sync::mpsc::unbounded_channel();

        let a = strategy_with("A", "BTCUSDT", "1", vec!["WIFUSDT"]);
        let b = strategy_with("B", "BTCUSDT", "1", vec!["WIFUSDT"]);
        fanout.register(&a, tx_a);
        fanout.register(&b, tx_b);

        assert_eq!(fanout.subscription_count(), 2);
        let btc_key = SubscriptionKey {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::Minutes(1),
            category: Category::Linear,
        };
        let wif_key = SubscriptionKey {
            symbol: "WIFUSDT".to_string(),
            timeframe: Timeframe::Minutes(1),
            category: Category::Linear,
        };
        assert_eq!(fanout.subscribers_for(&btc_key), 2);
        assert_eq!(fanout.subscribers_for(&wif_key), 2);
    }

    #[test]
    fn unregister_removes_empty_keys() {
        let fanout = FanOut::new(dummy_client());
        let (tx_a, _rx_a) = tokio::sync::mpsc::unbounded_channel();
        let a = strategy_with("A", "BTCUSDT", "1", vec!["WIFUSDT"]);
        fanout.register(&a, tx_a);
        assert_eq!(fanout.subscription_count(), 2);
        fanout.unregister("A");
        assert_eq!(fanout.subscription_count(), 0);
    }

    #[test]
    fn register_is_idempotent_per_strategy_name() {
        let fanout = FanOut::new(dummy_client());
        let (tx_a, _rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_a2, _rx_a2) = tokio::sync::mpsc::unbounded_channel();
        let a = strategy_with("A", "BTCUSDT", "1", vec!["WIFUSDT"]);
        fanout.register(&a, tx_a);
        fanout.register(&a, tx_a2);
        let btc_key = SubscriptionKey {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::Minutes(1),
            category: Category::Linear,
        };
        assert_eq!(fanout.subscribers_for(&btc_key), 1);
    }
}
