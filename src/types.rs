// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Long/short/either admissibility filter shared by signals and strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Short,
    Any,
    Long,
}

impl Direction {
    pub fn from_i32(v: i32) -> anyhow::Result<Self> {
        match v {
            -1 => Ok(Direction::Short),
            0 => Ok(Direction::Any),
            1 => Ok(Direction::Long),
            other => anyhow::bail!("direction must be -1, 0 or 1, got {other}"),
        }
    }

    pub fn admits(self, side: Side) -> bool {
        match self {
            Direction::Any => true,
            Direction::Long => side == Side::Buy,
            Direction::Short => side == Side::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_change(change: f64) -> Side {
        if change > 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn flip(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Parsed shape of a timeframe string: seconds means REST polling,
/// everything else means WebSocket. Parsed once at config time so the
/// rest of the system never re-parses timeframe strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Seconds(u32),
    Minutes(u32),
    Day,
    Week,
    Month,
}

impl Timeframe {
    pub fn parse(raw: &str) -> anyhow::Result<Timeframe> {
        if let Some(n) = raw.strip_suffix('s') {
            let secs: u32 = n
                .parse()
                .map_err(|_| anyhow::anyhow!("bad seconds frame: {raw}"))?;
            return Ok(Timeframe::Seconds(secs));
        }
        match raw {
            "D" => Ok(Timeframe::Day),
            "W" => Ok(Timeframe::Week),
            "M" => Ok(Timeframe::Month),
            minutes => {
                let n: u32 = minutes
                    .parse()
                    .map_err(|_| anyhow::anyhow!("unrecognized timeframe: {raw}"))?;
                Ok(Timeframe::Minutes(n))
            }
        }
    }

    pub fn uses_polling(self) -> bool {
        matches!(self, Timeframe::Seconds(_))
    }

    pub fn as_seconds(self) -> u64 {
        match self {
            Timeframe::Seconds(n) => n as u64,
            Timeframe::Minutes(n) => n as u64 * 60,
            Timeframe::Day => 86_400,
            Timeframe::Week => 604_800,
            Timeframe::Month => 2_592_000,
        }
    }

    /// The string the exchange's REST/WS endpoints expect for this timeframe.
    pub fn wire(self) -> String {
        match self {
            Timeframe::Seconds(n) => format!("{n}s"),
            Timeframe::Minutes(n) => n.to_string(),
            Timeframe::Day => "D".to_string(),
            Timeframe::Week => "W".to_string(),
            Timeframe::Month => "M".to_string(),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire())
    }
}

/// Product category on the exchange; drives which REST/WS namespace is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Spot,
    Linear,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Spot => write!(f, "spot"),
            Category::Linear => write!(f, "linear"),
        }
    }
}

/// OHLCV candle. `confirmed` mirrors the exchange's `confirm` flag: only
/// confirmed bars participate in buffer updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::Closed => "CLOSED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Tp,
    Sl,
    Manual,
    Unknown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Tp => "TP",
            CloseReason::Sl => "SL",
            CloseReason::Manual => "MANUAL",
            CloseReason::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Whether we are running against real funds or a simulated account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_seconds_minutes_and_calendar() {
        assert_eq!(Timeframe::parse("5s").unwrap(), Timeframe::Seconds(5));
        assert_eq!(Timeframe::parse("15").unwrap(), Timeframe::Minutes(15));
        assert_eq!(Timeframe::parse("D").unwrap(), Timeframe::Day);
        assert_eq!(Timeframe::parse("W").unwrap(), Timeframe::Week);
        assert_eq!(Timeframe::parse("M").unwrap(), Timeframe::Month);
        assert!(Timeframe::parse("bogus").is_err());
    }

    #[test]
    fn timeframe_polling_only_for_seconds() {
        assert!(Timeframe::Seconds(1).uses_polling());
        assert!(!Timeframe::Minutes(1).uses_polling());
        assert!(!Timeframe::Day.uses_polling());
    }

    #[test]
    fn direction_admits_matches_spec_table() {
        assert!(Direction::Any.admits(Side::Buy));
        assert!(Direction::Any.admits(Side::Sell));
        assert!(Direction::Long.admits(Side::Buy));
        assert!(!Direction::Long.admits(Side::Sell));
        assert!(Direction::Short.admits(Side::Sell));
        assert!(!Direction::Short.admits(Side::Buy));
    }
}
