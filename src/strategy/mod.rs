//! Multi-Signal Strategy Engine: per-strategy rolling buffers, history
//! preload, trigger evaluation, and signal emission. Ported from
//! `multi_signal_strategy.py`'s `_check_signal`/`preload_history`, with the
//! per-signal lock narrowed to append+endpoint-capture only (spec §9,
//! §4.3.a): the slippage ticker fetch always happens after the lock guard
//! is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::{SignalConfig, StrategyConfig};
use crate::exchange::ExchangeClient;
use crate::fanout::FanoutMessage;
use crate::types::{Direction, Side, Timestamp};

#[derive(Debug, Clone)]
pub struct SignalResult {
    pub strategy_name: String,
    pub signal_name: String,
    pub action: Side,
    pub index_symbol: String,
    pub trade_pair: String,
    pub entry_reference_price: f64,
    pub index_change: f64,
    pub target_change: f64,
    pub slippage_ok: bool,
    pub timestamp: Timestamp,
}

struct SignalBufferState {
    index_prices: VecDeque<f64>,
    target_prices: HashMap<String, VecDeque<f64>>,
    capacity: usize,
}

fn push_capped(buf: &mut VecDeque<f64>, value: f64, capacity: usize) {
    buf.push_back(value);
    while buf.len() > capacity {
        buf.pop_front();
    }
}

/// Endpoints `(i0, i1, t0, t1)` per the tick-window rule: when tick_window
/// > 0 compare buffer head vs. tail, else compare the last two entries.
fn compute_endpoints(state: &SignalBufferState, pair: &str, tick_window: u32) -> Option<(f64, f64, f64, f64)> {
    let required = tick_window.max(2) as usize;
    if state.index_prices.len() < required {
        return None;
    }
    let target = state.target_prices.get(pair)?;
    if target.len() < required {
        return None;
    }
    if tick_window > 0 {
        Some((
            *state.index_prices.front()?,
            *state.index_prices.back()?,
            *target.front()?,
            *target.back()?,
        ))
    } else {
        let il = state.index_prices.len();
        let tl = target.len();
        Some((state.index_prices[il - 2], state.index_prices[il - 1], target[tl - 2], target[tl - 1]))
    }
}

pub struct StrategyEngine {
    pub config: StrategyConfig,
    client: Arc<ExchangeClient>,
    buffers: HashMap<String, Mutex<SignalBufferState>>,
    signals_generated: AtomicU64,
    history_loaded: AtomicBool,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig, client: Arc<ExchangeClient>) -> Self {
        let mut buffers = HashMap::new();
        for (name, sig) in &config.signals {
            let capacity = sig.tick_window.max(2) as usize;
            let mut target_prices = HashMap::new();
            for pair in &config.trade_pairs {
                target_prices.insert(pair.clone(), VecDeque::with_capacity(capacity));
            }
            buffers.insert(
                name.clone(),
                Mutex::new(SignalBufferState {
                    index_prices: VecDeque::with_capacity(capacity),
                    target_prices,
                    capacity,
                }),
            );
        }
        StrategyEngine {
            config,
            client,
            buffers,
            signals_generated: AtomicU64::new(0),
            history_loaded: AtomicBool::new(false),
        }
    }

    pub fn signals_generated(&self) -> u64 {
        self.signals_generated.load(Ordering::Relaxed)
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded.load(Ordering::Relaxed)
    }

    /// Fetches `max(tickWindow, 2)` bars per (symbol, timeframe) for the
    /// signal's index and each trade pair, then seeds the buffer per the
    /// tick-window rule (§4.3).
    pub async fn preload_history(&self) {
        for (name, sig) in &self.config.signals {
            let limit = sig.tick_window.max(2);
            let index_category = self.config.category_for(&sig.index);
            let index_bars = self
                .client
                .get_klines(index_category, &sig.index, &sig.frame.wire(), limit)
                .await;
            if index_bars.is_empty() {
                error!(strategy = %self.config.name, signal = %name, "failed to preload index history");
                continue;
            }

            let mut target_bars = HashMap::new();
            for pair in &self.config.trade_pairs {
                let category = self.config.category_for(pair);
                let bars = self.client.get_klines(category, pair, &sig.frame.wire(), limit).await;
                if !bars.is_empty() {
                    target_bars.insert(pair.clone(), bars);
                }
            }
            if target_bars.is_empty() {
                error!(strategy = %self.config.name, signal = %name, "failed to preload trade-pair history");
                continue;
            }

            let mut state = self.buffers[name].lock().await;
            if sig.tick_window > 0 {
                for bar in &index_bars[..index_bars.len().saturating_sub(1)] {
                    state.index_prices.push_back(bar.close);
                }
                for (pair, bars) in &target_bars {
                    if let Some(buf) = state.target_prices.get_mut(pair) {
                        for bar in &bars[..bars.len().saturating_sub(1)] {
                            buf.push_back(bar.close);
                        }
                    }
                }
            } else {
                if index_bars.len() >= 2 {
                    state.index_prices.push_back(index_bars[index_bars.len() - 2].close);
                }
                for (pair, bars) in &target_bars {
                    if bars.len() >= 2 {
                        if let Some(buf) = state.target_prices.get_mut(pair) {
                            buf.push_back(bars[bars.len() - 2].close);
                        }
                    }
                }
            }
        }
        self.history_loaded.store(true, Ordering::Relaxed);
    }

    /// Clears all buffers and re-preloads history. Invoked by the
    /// coordinator after a successful position open.
    pub async fn reset_buffers(&self) {
        for mutex in self.buffers.values() {
            let mut state = mutex.lock().await;
            state.index_prices.clear();
            for buf in state.target_prices.values_mut() {
                buf.clear();
            }
        }
        self.history_loaded.store(false, Ordering::Relaxed);
        self.preload_history().await;
    }

    /// Applies an incoming confirmed bar to every matching signal buffer,
    /// then evaluates that signal's trigger.
    pub async fn on_fanout_message(&self, msg: &FanoutMessage, emit: &UnboundedSender<SignalResult>) {
        for (name, sig) in &self.config.signals {
            if sig.frame != msg.timeframe {
                continue;
            }
            let is_index = sig.index == msg.symbol;
            let is_trade_pair = self.config.trade_pairs.iter().any(|p| p == &msg.symbol);
            if !is_index && !is_trade_pair {
                continue;
            }
            {
                let mut state = self.buffers[name].lock().await;
                if is_index {
                    let capacity = state.capacity;
                    push_capped(&mut state.index_prices, msg.bar.close, capacity);
                } else if let Some(buf) = state.target_prices.get_mut(&msg.symbol) {
                    let capacity = state.capacity;
                    push_capped(buf, msg.bar.close, capacity);
                }
            }
            self.evaluate_trigger(name, sig, emit).await;
        }
    }

    async fn evaluate_trigger(&self, signal_name: &str, sig: &SignalConfig, emit: &UnboundedSender<SignalResult>) {
        for pair in &self.config.trade_pairs {
            let endpoints = {
                let state = self.buffers[signal_name].lock().await;
                compute_endpoints(&state, pair, sig.tick_window)
            };
            let Some((i0, i1, t0, t1)) = endpoints else {
                continue;
            };
            if i0 == 0.0 || t0 == 0.0 {
                continue;
            }

            let index_change = (i1 - i0) / i0 * 100.0;
            let target_change = (t1 - t0) / t0 * 100.0;

            // Gate A: magnitude.
            if index_change.abs() < sig.index_change_threshold {
                continue;
            }
            // Gate B: signal-level direction.
            if sig.direction == Direction::Long && index_change < 0.0 {
                continue;
            }
            if sig.direction == Direction::Short && index_change > 0.0 {
                continue;
            }
            // Gate C: target cap.
            if target_change.abs() >= sig.target {
                continue;
            }
            // Gate D: co-movement.
            let same_dir = (index_change > 0.0 && target_change > 0.0) || (index_change < 0.0 && target_change < 0.0);
            if !same_dir {
                continue;
            }

            let raw_action = Side::from_change(index_change);
            let action = if sig.reverse { raw_action.flip() } else { raw_action };

            // Gate E: strategy-level direction.
            if !self.config.should_take_signal(action) {
                continue;
            }

            let category = self.config.category_for(pair);
            let (entry_reference_price, slippage_ok) = match self.client.get_ticker(category, pair).await {
                Some(ticker) => {
                    let diff_pct = if t1 != 0.0 {
                        ((ticker.last_price - t1) / t1).abs() * 100.0
                    } else {
                        0.0
                    };
                    (ticker.last_price, diff_pct <= self.config.price_change_threshold)
                }
                // Reference price unavailable: treated as slippage-ok (spec §9 open question).
                None => (t1, true),
            };

            let result = SignalResult {
                strategy_name: self.config.name.clone(),
                signal_name: signal_name.to_string(),
                action,
                index_symbol: sig.index.clone(),
                trade_pair: pair.clone(),
                entry_reference_price,
                index_change,
                target_change,
                slippage_ok,
                timestamp: Utc::now(),
            };

            self.signals_generated.fetch_add(1, Ordering::Relaxed);
            info!(
                strategy = %self.config.name, signal = %signal_name, action = %action,
                index_change, target_change, "signal triggered"
            );
            let _ = emit.send(result);
        }
    }

    pub async fn run(self: Arc<Self>, mut rx: UnboundedReceiver<FanoutMessage>, emit: UnboundedSender<SignalResult>) {
        while let Some(msg) = rx.recv().await {
            self.on_fanout_message(&msg, &emit).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn engine_with(tick_window: u32, threshold: f64, target: f64, direction: Direction, reverse: bool) -> StrategyEngine {
        let mut signals = Map::new();
        signals.insert(
            "s1".to_string(),
            SignalConfig {
                index: "BTCUSDT".to_string(),
                frame: crate::types::Timeframe::Minutes(1),
                tick_window,
                index_change_threshold: threshold,
                target,
                direction,
                reverse,
            },
        );
        let config = StrategyConfig {
            name: "alpha".to_string(),
            trade_pairs: vec!["WIFUSDT".to_string()],
            leverage: 5,
            tick_window,
            price_change_threshold: 1.0,
            stop_take_percent: 0.01,
            position_size: 100.0,
            direction: Direction::Any,
            signals,
            enabled: true,
        };
        let client = Arc::new(ExchangeClient::new("k".into(), "s".into(), true).unwrap());
        StrategyEngine::new(config, client)
    }

    fn seed(engine: &StrategyEngine, index: &[f64], target: &[f64]) {
        let state = &engine.buffers["s1"];
        let mut guard = state.try_lock().unwrap();
        for v in index {
            guard.index_prices.push_back(*v);
        }
        for v in target {
            guard.target_prices.get_mut("WIFUSDT").unwrap().push_back(*v);
        }
    }

    #[test]
    fn compute_endpoints_uses_head_tail_when_windowed() {
        let engine = engine_with(5, 1.0, 0.8, Direction::Any, false);
        seed(&engine, &[50000.0, 50100.0, 50200.0, 50300.0, 50600.0], &[1.0000, 1.0020, 1.0030, 1.0050, 1.0070]);
        let state = engine.buffers["s1"].try_lock().unwrap();
        let (i0, i1, t0, t1) = compute_endpoints(&state, "WIFUSDT", 5).unwrap();
        assert_eq!(i0, 50000.0);
        assert_eq!(i1, 50600.0);
        assert_eq!(t0, 1.0000);
        assert_eq!(t1, 1.0070);
    }

    #[test]
    fn compute_endpoints_uses_last_two_when_tick_window_zero() {
        let engine = engine_with(0, 1.0, 0.8, Direction::Any, false);
        seed(&engine, &[50000.0, 50600.0], &[1.0000, 1.0070]);
        let state = engine.buffers["s1"].try_lock().unwrap();
        let (i0, i1, t0, t1) = compute_endpoints(&state, "WIFUSDT", 0).unwrap();
        assert_eq!((i0, i1, t0, t1), (50000.0, 50600.0, 1.0000, 1.0070));
    }

    #[tokio::test]
    async fn trigger_fires_buy_on_comovement() {
        let engine = engine_with(5, 1.0, 0.8, Direction::Any, false);
        seed(&engine, &[50000.0, 50100.0, 50200.0, 50300.0, 50600.0], &[1.0000, 1.0020, 1.0030, 1.0050, 1.0070]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.evaluate_trigger("s1", &engine.config.signals["s1"], &tx).await;
        let result = rx.try_recv().unwrap();
        assert_eq!(result.action, Side::Buy);
        assert!((result.index_change - 1.2).abs() < 0.05);
    }

    #[tokio::test]
    async fn direction_filter_blocks_opposing_strategy_direction() {
        let mut engine = engine_with(5, 1.0, 0.8, Direction::Any, false);
        engine.config.direction = Direction::Short;
        seed(&engine, &[50000.0, 50100.0, 50200.0, 50300.0, 50600.0], &[1.0000, 1.0020, 1.0030, 1.0050, 1.0070]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.evaluate_trigger("s1", &engine.config.signals["s1"], &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reverse_flag_inverts_action() {
        let engine = engine_with(5, 1.0, 0.8, Direction::Any, true);
        seed(&engine, &[50000.0, 50100.0, 50200.0, 50300.0, 50600.0], &[1.0000, 1.0020, 1.0030, 1.0050, 1.0070]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.evaluate_trigger("s1", &engine.config.signals["s1"], &tx).await;
        let result = rx.try_recv().unwrap();
        assert_eq!(result.action, Side::Sell);
    }
}
