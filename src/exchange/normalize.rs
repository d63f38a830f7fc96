//! Instrument normalization pure functions and the Instrument Spec Cache.
//! Algorithm and constants ported from the `normalize_order`/`_floor_to_step`
//! family exercised by `tests/test_order_normalization.py` and
//! `tests/test_bybit_client_normalization.py` in the original source.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::warn;

use crate::types::{Category, Side};

use super::client::ExchangeClient;

const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentSpec {
    pub qty_step: f64,
    pub min_qty: f64,
    pub tick_size: f64,
    pub min_notional: f64,
}

impl Default for InstrumentSpec {
    /// Fallback used on `InstrumentSpecMissing`, per the specification.
    fn default() -> Self {
        InstrumentSpec {
            qty_step: 1.0,
            min_qty: 1.0,
            tick_size: 1e-4,
            min_notional: 5.0,
        }
    }
}

pub fn floor_to_step(v: f64, step: f64) -> f64 {
    if step == 0.0 {
        return v;
    }
    (v / step).floor() * step
}

pub fn ceil_to_step(v: f64, step: f64) -> f64 {
    if step == 0.0 {
        return v;
    }
    (v / step).ceil() * step
}

/// Number of fractional digits needed to render `step` exactly, capped to
/// avoid infinite loops on irrational floating-point residue.
pub fn decimal_places(step: f64) -> usize {
    if step <= 0.0 {
        return 0;
    }
    let mut s = step;
    let mut places = 0usize;
    while (s.round() - s).abs() > 1e-9 && places < 10 {
        s *= 10.0;
        places += 1;
    }
    places
}

#[derive(Debug, Clone)]
pub struct NormalizedOrder {
    pub qty: String,
    pub take_profit: String,
    pub stop_loss: String,
    pub qty_value: f64,
}

/// Computes order qty/TP/SL normalized to the instrument's step sizes, with
/// side-aware TP/SL rounding so the bracket never widens in the trader's
/// favor: Buy floors TP and ceils SL, Sell ceils TP and floors SL.
pub fn normalize_order(
    side: Side,
    last_price: f64,
    notional_usdt: f64,
    take_profit: f64,
    stop_loss: f64,
    spec: &InstrumentSpec,
) -> anyhow::Result<NormalizedOrder> {
    let last_price = last_price.max(1e-12);
    let raw_qty = notional_usdt / last_price;
    let mut qty = floor_to_step(raw_qty, spec.qty_step);
    if qty < spec.min_qty {
        qty = spec.min_qty;
    }
    if qty * last_price < spec.min_notional {
        qty = ceil_to_step(spec.min_notional / last_price, spec.qty_step);
    }
    if qty <= 0.0 {
        anyhow::bail!("normalized quantity is non-positive");
    }

    let (tp, sl) = match side {
        Side::Buy => (
            floor_to_step(take_profit, spec.tick_size),
            ceil_to_step(stop_loss, spec.tick_size),
        ),
        Side::Sell => (
            ceil_to_step(take_profit, spec.tick_size),
            floor_to_step(stop_loss, spec.tick_size),
        ),
    };

    let qty_places = decimal_places(spec.qty_step);
    let tick_places = decimal_places(spec.tick_size);

    Ok(NormalizedOrder {
        qty: format!("{qty:.qty_places$}"),
        take_profit: format!("{tp:.tick_places$}"),
        stop_loss: format!("{sl:.tick_places$}"),
        qty_value: qty,
    })
}

#[derive(Clone, Copy)]
struct CacheEntry {
    spec: InstrumentSpec,
    fetched_at: Instant,
}

/// Read-mostly TTL cache of instrument specs, write-on-miss under its own
/// guard (per the concurrency model's shared-resource policy).
pub struct InstrumentCache {
    entries: RwLock<HashMap<(Category, String), CacheEntry>>,
}

impl InstrumentCache {
    pub fn new() -> Self {
        InstrumentCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        client: &ExchangeClient,
        category: Category,
        symbol: &str,
    ) -> InstrumentSpec {
        let key = (category, symbol.to_string());
        if let Some(entry) = self.entries.read().get(&key) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return entry.spec;
            }
        }

        match client.get_instruments_info(category, symbol).await {
            Some(spec) => {
                self.entries.write().insert(
                    key,
                    CacheEntry {
                        spec,
                        fetched_at: Instant::now(),
                    },
                );
                spec
            }
            None => {
                warn!(symbol, %category, "instrument spec missing, using fallback defaults");
                InstrumentSpec::default()
            }
        }
    }
}

impl Default for InstrumentCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_places_matches_common_steps() {
        assert_eq!(decimal_places(1.0), 0);
        assert_eq!(decimal_places(0.01), 2);
        assert_eq!(decimal_places(0.001), 3);
        assert_eq!(decimal_places(0.0001), 4);
    }

    #[test]
    fn floor_and_ceil_bracket_the_value() {
        assert!(floor_to_step(1.2345, 0.01) <= 1.2345);
        assert!(ceil_to_step(1.2345, 0.01) >= 1.2345);
        assert_eq!(floor_to_step(5.0, 0.0), 5.0);
        assert_eq!(ceil_to_step(5.0, 0.0), 5.0);
    }

    #[test]
    fn normalization_scenario_wif_buy() {
        let spec = InstrumentSpec {
            qty_step: 1.0,
            min_qty: 1.0,
            tick_size: 0.0001,
            min_notional: 5.0,
        };
        let out = normalize_order(Side::Buy, 0.4150, 100.0, 0.41707500, 0.41292500, &spec).unwrap();
        assert_eq!(out.qty, "240");
        assert_eq!(out.take_profit, "0.4170");
        assert_eq!(out.stop_loss, "0.4130");
    }

    #[test]
    fn normalization_scenario_sol_sell() {
        let spec = InstrumentSpec {
            qty_step: 0.01,
            min_qty: 0.01,
            tick_size: 0.001,
            min_notional: 5.0,
        };
        let out = normalize_order(Side::Sell, 157.09, 50.0, 156.46164, 157.71836, &spec).unwrap();
        let qty: f64 = out.qty.parse().unwrap();
        assert!((qty / 0.01).round() * 0.01 - qty < 1e-9);
        let tp: f64 = out.take_profit.parse().unwrap();
        let sl: f64 = out.stop_loss.parse().unwrap();
        assert!(tp >= 156.462 - 1e-9);
        assert!(sl <= 157.718 + 1e-9);
    }

    #[test]
    fn min_notional_forces_quantity_up() {
        let spec = InstrumentSpec {
            qty_step: 0.1,
            min_qty: 0.1,
            tick_size: 0.01,
            min_notional: 10.0,
        };
        let out = normalize_order(Side::Buy, 1.0, 1.0, 1.1, 0.9, &spec).unwrap();
        assert!(out.qty_value * 1.0 >= spec.min_notional - 1e-9);
    }

    #[test]
    fn side_aware_rounding_never_widens_the_favorable_bracket() {
        let spec = InstrumentSpec {
            qty_step: 1.0,
            min_qty: 1.0,
            tick_size: 0.01,
            min_notional: 5.0,
        };
        let buy = normalize_order(Side::Buy, 100.0, 1000.0, 105.07, 94.03, &spec).unwrap();
        let tp: f64 = buy.take_profit.parse().unwrap();
        let sl: f64 = buy.stop_loss.parse().unwrap();
        assert!(tp <= 105.07);
        assert!(sl >= 94.03);

        let sell = normalize_order(Side::Sell, 100.0, 1000.0, 94.93, 105.97, &spec).unwrap();
        let tp: f64 = sell.take_profit.parse().unwrap();
        let sl: f64 = sell.stop_loss.parse().unwrap();
        assert!(tp >= 94.93);
        assert!(sl <= 105.97);
    }
}
