//! Telegram notifications. Four message shapes, each independently gated
//! by a config flag. Grounded in
//! `src/notifications/telegram_notifier.py`. Every call is fire-and-forget:
//! notification delivery never blocks or fails the trading loop, mirroring
//! the original's best-effort `send_message`.

use tracing::{error, warn};

use crate::config::TelegramConfig;
use crate::types::{CloseReason, Side};

pub struct Notifier {
    config: TelegramConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(config: TelegramConfig) -> Self {
        Notifier {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn send(&self, text: String) {
        if !self.config.enabled || self.config.bot_token.is_empty() || self.config.chat_id.is_empty() {
            return;
        }
        let http = self.http.clone();
        let bot_token = self.config.bot_token.clone();
        let chat_id = self.config.chat_id.clone();
        tokio::spawn(async move {
            let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
            let body = serde_json::json!({ "chat_id": chat_id, "text": text, "parse_mode": "Markdown" });
            if let Err(e) = http.post(&url).json(&body).send().await {
                warn!(%e, "telegram notification failed to send");
            }
        });
    }

    pub fn notify_signal(&self, strategy_name: &str, pair: &str, action: Side, index_change: f64) {
        if !self.config.notify_signals {
            return;
        }
        self.send(format!(
            "📡 *Signal* `{strategy_name}` {pair}\naction: {action}\nindex change: {index_change:.3}%"
        ));
    }

    pub fn notify_trade_opened(&self, strategy_name: &str, pair: &str, side: Side, qty: f64, entry_price: f64) {
        if !self.config.notify_trades {
            return;
        }
        self.send(format!(
            "🟢 *Opened* `{strategy_name}` {pair}\nside: {side}\nqty: {qty}\nentry: {entry_price}"
        ));
    }

    pub fn notify_trade_closed(&self, strategy_name: &str, pair: &str, reason: CloseReason, pnl: f64, pnl_percent: f64) {
        if !self.config.notify_trades {
            return;
        }
        self.send(format!(
            "🔴 *Closed* `{strategy_name}` {pair}\nreason: {reason}\npnl: {pnl:.4} USDT ({pnl_percent:.2}%)"
        ));
    }

    pub fn notify_error(&self, message: &str) {
        if !self.config.notify_errors {
            error!(message, "notify_error");
            return;
        }
        self.send(format!("⚠️ *Error*\n{message}"));
    }

    pub fn notify_daily_report(&self, report_text: &str) {
        if !self.config.notify_daily_report {
            return;
        }
        self.send(format!("📊 *Daily report*\n{report_text}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_config() -> TelegramConfig {
        TelegramConfig {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            notify_signals: true,
            notify_trades: true,
            notify_errors: true,
            notify_daily_report: true,
        }
    }

    #[test]
    fn disabled_notifier_does_not_panic_on_any_message() {
        let notifier = Notifier::new(disabled_config());
        notifier.notify_signal("alpha", "WIFUSDT", Side::Buy, 1.2);
        notifier.notify_trade_opened("alpha", "WIFUSDT", Side::Buy, 240.0, 0.415);
        notifier.notify_trade_closed("alpha", "WIFUSDT", CloseReason::Tp, 0.48, 0.48);
        notifier.notify_error("boom");
        notifier.notify_daily_report("0 trades today");
    }

    #[test]
    fn gating_flags_suppress_individual_message_kinds() {
        let mut config = disabled_config();
        config.enabled = true;
        config.bot_token = "t".to_string();
        config.chat_id = "c".to_string();
        config.notify_signals = false;
        let notifier = Notifier::new(config);
        // Would attempt a send if not gated; absence of a panic/hang confirms the early return.
        notifier.notify_signal("alpha", "WIFUSDT", Side::Buy, 1.2);
    }
}
