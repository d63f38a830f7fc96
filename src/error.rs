//! Error taxonomy. Only [`ConfigError`] is allowed to terminate the process;
//! every other failure mode is logged at its origin and absorbed into a safe
//! default, per the propagation policy in the specification.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing api credentials (set api.api_key/api_secret or BYBIT_API_KEY/BYBIT_API_SECRET)")]
    MissingCredentials,
    #[error("no enabled strategies configured")]
    NoStrategies,
    #[error("strategy '{0}': leverage=1 (spot) requires direction=0")]
    SpotRequiresNeutralDirection(String),
    #[error("strategy '{0}': signal '{1}' has invalid timeframe '{2}'")]
    BadTimeframe(String, String, String),
    #[error("strategy '{0}' has no signals")]
    NoSignals(String),
    #[error("strategy '{0}' has no trade pairs")]
    NoTradePairs(String),
    #[error("{0}")]
    Other(String),
}
