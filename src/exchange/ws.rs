//! WebSocket kline subscription. Structurally grounded in
//! `market_data/candle_buffer.rs::run_kline_stream` (connect, read loop,
//! reconnect-with-backoff shape), re-targeted at Bybit v5's
//! `kline.<interval>.<symbol>` topic and its `confirm` flag (§6).

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::types::{Bar, Category};

fn ws_url(category: Category) -> &'static str {
    match category {
        Category::Spot => "wss://stream.bybit.com/v5/public/spot",
        Category::Linear => "wss://stream.bybit.com/v5/public/linear",
    }
}

/// Connects once, subscribes to a single kline topic, and calls `on_bar`
/// for every confirmed bar received. Returns (without error) when the
/// socket closes normally; the caller is responsible for the reconnect
/// loop and its health/backoff policy (§4.2).
pub async fn stream_kline<F>(
    category: Category,
    symbol: &str,
    interval: &str,
    mut on_bar: F,
) -> anyhow::Result<()>
where
    F: FnMut(Bar),
{
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(category)).await?;

    let topic = format!("kline.{interval}.{symbol}");
    let subscribe = json!({ "op": "subscribe", "args": [topic] });
    socket.send(Message::Text(subscribe.to_string())).await?;

    while let Some(msg) = socket.next().await {
        let msg = msg?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            Message::Ping(payload) => {
                socket.send(Message::Pong(payload)).await?;
                continue;
            }
            _ => continue,
        };
        match parse_kline_message(&text) {
            Some(bars) => {
                for bar in bars {
                    if bar.confirmed {
                        on_bar(bar);
                    }
                }
            }
            None => debug!(%text, "unhandled ws payload"),
        }
    }

    Ok(())
}

fn parse_kline_message(text: &str) -> Option<Vec<Bar>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let topic = value.get("topic")?.as_str()?;
    if !topic.starts_with("kline.") {
        return None;
    }
    let data = value.get("data")?.as_array()?;
    let mut bars = Vec::with_capacity(data.len());
    for row in data {
        bars.push(Bar {
            timestamp_ms: row.get("start")?.as_i64().unwrap_or(0),
            open: parse_f64(row.get("open")?),
            high: parse_f64(row.get("high")?),
            low: parse_f64(row.get("low")?),
            close: parse_f64(row.get("close")?),
            volume: parse_f64(row.get("volume")?),
            confirmed: row.get("confirm").and_then(Value::as_bool).unwrap_or(false),
        });
    }
    if bars.is_empty() {
        warn!(%text, "kline message carried no rows");
    }
    Some(bars)
}

fn parse_f64(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_confirmed_kline_payload() {
        let text = r#"{
            "topic": "kline.1.BTCUSDT",
            "data": [{"start": 1000, "open": "1", "high": "2", "low": "0.5", "close": "1.5", "volume": "10", "confirm": true}]
        }"#;
        let bars = parse_kline_message(text).unwrap();
        assert_eq!(bars.len(), 1);
        assert!(bars[0].confirmed);
        assert_eq!(bars[0].close, 1.5);
    }

    #[test]
    fn ignores_non_kline_topics() {
        assert!(parse_kline_message(r#"{"topic": "orderbook.1.BTCUSDT", "data": []}"#).is_none());
    }
}
