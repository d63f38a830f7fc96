//! Configuration loading: JSON file + environment overrides, validated once
//! at startup. Grounded in `runtime_config.rs`'s serde-default conventions
//! and `src/config.py`'s env-override/validation rules.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{Category, Direction, Timeframe};

fn default_logging_level() -> String {
    "INFO".to_string()
}

fn default_database_path() -> String {
    "data/trading.db".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfigFile {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default)]
    pub demo_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub demo_mode: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfigFile {
    pub max_stop_loss_trades: u32,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_true")]
    pub notify_signals: bool,
    #[serde(default = "default_true")]
    pub notify_trades: bool,
    #[serde(default = "default_true")]
    pub notify_errors: bool,
    #[serde(default = "default_true")]
    pub notify_daily_report: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            notify_signals: true,
            notify_trades: true,
            notify_errors: true,
            notify_daily_report: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalConfigFile {
    pub index: String,
    pub frame: String,
    pub tick_window: u32,
    pub index_change_threshold: f64,
    pub target: f64,
    pub direction: i32,
    pub reverse: u8,
}

/// Per-signal trigger parameters, with the timeframe parsed once.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub index: String,
    pub frame: Timeframe,
    pub tick_window: u32,
    pub index_change_threshold: f64,
    pub target: f64,
    pub direction: Direction,
    pub reverse: bool,
}

impl SignalConfig {
    fn from_file(name: &str, strategy_name: &str, f: SignalConfigFile) -> Result<Self, ConfigError> {
        if f.index_change_threshold <= 0.0 {
            return Err(ConfigError::Other(format!(
                "strategy '{strategy_name}' signal '{name}': index_change_threshold must be > 0"
            )));
        }
        let frame = Timeframe::parse(&f.frame).map_err(|_| {
            ConfigError::BadTimeframe(strategy_name.to_string(), name.to_string(), f.frame.clone())
        })?;
        let direction = Direction::from_i32(f.direction)
            .map_err(|e| ConfigError::Other(format!("strategy '{strategy_name}' signal '{name}': {e}")))?;
        Ok(SignalConfig {
            index: f.index,
            frame,
            tick_window: f.tick_window,
            index_change_threshold: f.index_change_threshold,
            target: f.target,
            direction,
            reverse: f.reverse == 1,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfigFile {
    pub trade_pairs: Vec<String>,
    pub leverage: u32,
    pub tick_window: u32,
    pub price_change_threshold: f64,
    pub stop_take_percent: f64,
    pub position_size: f64,
    pub direction: i32,
    pub signals: HashMap<String, SignalConfigFile>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Per-strategy configuration, validated and with signals fully parsed.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub name: String,
    pub trade_pairs: Vec<String>,
    pub leverage: u32,
    pub tick_window: u32,
    pub price_change_threshold: f64,
    pub stop_take_percent: f64,
    pub position_size: f64,
    pub direction: Direction,
    pub signals: HashMap<String, SignalConfig>,
    pub enabled: bool,
}

impl StrategyConfig {
    pub fn is_spot(&self) -> bool {
        self.leverage == 1
    }

    pub fn market_category(&self) -> Category {
        if self.is_spot() {
            Category::Spot
        } else {
            Category::Linear
        }
    }

    /// Per-symbol category hook. The original source always falls back to
    /// the strategy-level category; this spec keeps that as a first-class
    /// (overridable) hook rather than collapsing it away.
    pub fn category_for(&self, _symbol: &str) -> Category {
        self.market_category()
    }

    pub fn should_take_signal(&self, side: crate::types::Side) -> bool {
        self.direction.admits(side)
    }

    fn from_file(name: &str, f: StrategyConfigFile) -> Result<Self, ConfigError> {
        if f.trade_pairs.is_empty() {
            return Err(ConfigError::NoTradePairs(name.to_string()));
        }
        if f.signals.is_empty() {
            return Err(ConfigError::NoSignals(name.to_string()));
        }
        if f.leverage < 1 {
            return Err(ConfigError::Other(format!("strategy '{name}': leverage must be >= 1")));
        }
        let direction = Direction::from_i32(f.direction)
            .map_err(|e| ConfigError::Other(format!("strategy '{name}': {e}")))?;
        if f.leverage == 1 && !matches!(direction, Direction::Any) {
            return Err(ConfigError::SpotRequiresNeutralDirection(name.to_string()));
        }
        let mut signals = HashMap::with_capacity(f.signals.len());
        for (signal_name, signal_file) in f.signals {
            signals.insert(
                signal_name.clone(),
                SignalConfig::from_file(&signal_name, name, signal_file)?,
            );
        }
        Ok(StrategyConfig {
            name: name.to_string(),
            trade_pairs: f.trade_pairs,
            leverage: f.leverage,
            tick_window: f.tick_window,
            price_change_threshold: f.price_change_threshold,
            stop_take_percent: f.stop_take_percent,
            position_size: f.position_size,
            direction,
            signals,
            enabled: f.enabled,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ConfigFile {
    api: ApiConfigFile,
    global: GlobalConfigFile,
    strategies: HashMap<String, StrategyConfigFile>,
    #[serde(default)]
    telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub max_stop_loss_trades: u32,
    pub database_path: String,
    pub logging_level: String,
    pub strategies: HashMap<String, StrategyConfig>,
    pub telegram: TelegramConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        let file: ConfigFile = serde_json::from_str(&raw)?;

        let api_key = env::var("BYBIT_API_KEY").unwrap_or(file.api.api_key);
        let api_secret = env::var("BYBIT_API_SECRET").unwrap_or(file.api.api_secret);
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        let testnet = env_bool("BYBIT_TESTNET", file.api.testnet);
        let demo_mode = env_bool("BYBIT_DEMO_MODE", file.api.demo_mode);

        let mut strategies = HashMap::with_capacity(file.strategies.len());
        for (name, strategy_file) in file.strategies {
            strategies.insert(name.clone(), StrategyConfig::from_file(&name, strategy_file)?);
        }
        if strategies.values().filter(|s| s.enabled).count() == 0 {
            return Err(ConfigError::NoStrategies);
        }

        let mut telegram = file.telegram.unwrap_or_default();
        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            telegram.bot_token = token;
        }
        if let Ok(chat_id) = env::var("TELEGRAM_CHAT_ID") {
            telegram.chat_id = chat_id;
        }

        let mut logging_level = file.global.logging_level.to_uppercase();
        if !["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"].contains(&logging_level.as_str()) {
            logging_level = "INFO".to_string();
        }

        Ok(Config {
            api: ApiConfig {
                api_key,
                api_secret,
                testnet,
                demo_mode,
            },
            max_stop_loss_trades: file.global.max_stop_loss_trades,
            database_path: file.global.database_path,
            logging_level,
            strategies,
            telegram,
        })
    }

    pub fn enabled_strategies(&self) -> impl Iterator<Item = &StrategyConfig> {
        self.strategies.values().filter(|s| s.enabled)
    }
}

fn env_bool(key: &str, file_value: bool) -> bool {
    match env::var(key) {
        Ok(v) => v.eq_ignore_ascii_case("true"),
        Err(_) => file_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp_config(contents: &str) -> tempfile_path::TempConfig {
        tempfile_path::TempConfig::new(contents)
    }

    // Minimal scratch-file helper kept local to this test module: the
    // teacher's test style writes fixtures inline rather than pulling in a
    // tempfile crate dependency for a handful of config tests.
    mod tempfile_path {
        use std::io::Write;

        pub struct TempConfig {
            pub path: std::path::PathBuf,
        }

        impl TempConfig {
            pub fn new(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("correlate_bot_test_{}.json", uuid::Uuid::new_v4()));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }
        }

        impl Drop for TempConfig {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    const VALID: &str = r#"
    {
      "api": {"api_key": "k", "api_secret": "s", "testnet": true, "demo_mode": true},
      "global": {"max_stop_loss_trades": 3, "database_path": "data/t.db", "logging_level": "info"},
      "strategies": {
        "alpha": {
          "trade_pairs": ["WIFUSDT"],
          "leverage": 5,
          "tick_window": 5,
          "price_change_threshold": 0.5,
          "stop_take_percent": 0.01,
          "position_size": 100,
          "direction": 0,
          "signals": {
            "s1": {"index": "BTCUSDT", "frame": "1", "tick_window": 5, "index_change_threshold": 1.0, "target": 0.8, "direction": 0, "reverse": 0}
          }
        }
      }
    }"#;

    #[test]
    fn loads_valid_config_with_env_precedence() {
        let tmp = write_temp_config(VALID);
        let cfg = Config::load(&tmp.path).unwrap();
        assert_eq!(cfg.logging_level, "INFO");
        assert_eq!(cfg.strategies.len(), 1);
        let strategy = &cfg.strategies["alpha"];
        assert_eq!(strategy.market_category(), Category::Linear);
        assert!(strategy.signals.contains_key("s1"));
    }

    #[test]
    fn spot_leverage_requires_neutral_direction() {
        let bad = VALID.replace("\"leverage\": 5", "\"leverage\": 1").replace(
            "\"direction\": 0,\n          \"signals\"",
            "\"direction\": 1,\n          \"signals\"",
        );
        let tmp = write_temp_config(&bad);
        let err = Config::load(&tmp.path).unwrap_err();
        assert!(matches!(err, ConfigError::SpotRequiresNeutralDirection(_)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::load("/nonexistent/path/does/not/exist.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
