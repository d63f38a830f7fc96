//! Exchange Client: a thin, explicitly-shared (not singleton) adapter over
//! a Bybit-v5-shaped REST/WebSocket API. Grounded in `binance/client.rs`'s
//! request-signing and `#[instrument]` conventions, re-targeted at the
//! Bybit-shaped operations named in the specification and attested by
//! `src/api/bybit_client.py`.

mod client;
mod normalize;
pub mod ws;

pub use client::{ExchangeClient, Kline, OrderHistoryEntry, PlacedOrder, Position, Ticker, WalletBalance};
pub use normalize::{ceil_to_step, decimal_places, floor_to_step, normalize_order, InstrumentCache, InstrumentSpec};
