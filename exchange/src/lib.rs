pub mod adapter;
pub mod connect;
pub mod fetcher;
pub mod health;
pub mod resilience;

pub use adapter::{AdapterError, BarQuery, HistoryProvider, StreamEvent, TickSource};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use std::{fmt, str::FromStr};

/// Hard cap on bars per historical request, shared by every provider.
pub const MAX_PAGE_LIMIT: usize = 1000;

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Timeframe::M1 => "1m",
                Timeframe::M3 => "3m",
                Timeframe::M5 => "5m",
                Timeframe::M15 => "15m",
                Timeframe::M30 => "30m",
                Timeframe::H1 => "1h",
                Timeframe::H2 => "2h",
                Timeframe::H4 => "4h",
                Timeframe::H6 => "6h",
                Timeframe::H8 => "8h",
                Timeframe::H12 => "12h",
                Timeframe::D1 => "1d",
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 12] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
    ];

    pub fn to_minutes(self) -> u16 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H4 => 240,
            Timeframe::H6 => 360,
            Timeframe::H8 => 480,
            Timeframe::H12 => 720,
            Timeframe::D1 => 1440,
        }
    }

    pub fn to_seconds(self) -> u64 {
        u64::from(self.to_minutes()) * 60
    }

    /// Bucket used to pick resolution-dependent retry constants.
    pub fn class(self) -> ResolutionClass {
        match self {
            Timeframe::M1 | Timeframe::M3 | Timeframe::M5 => ResolutionClass::Fine,
            Timeframe::M15 | Timeframe::M30 | Timeframe::H1 => ResolutionClass::Medium,
            _ => ResolutionClass::Coarse,
        }
    }
}

impl FromStr for Timeframe {
    type Err = InvalidTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .find(|tf| tf.to_string() == s)
            .copied()
            .ok_or_else(|| InvalidTimeframe(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported interval: {0}")]
pub struct InvalidTimeframe(pub String);

/// Coarse grouping of intervals.
///
/// A fixed page covers far less wall-clock time at fine resolution, so retry
/// distances are configured per class rather than per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ResolutionClass {
    /// Up to 5 minutes
    Fine,
    /// 15 minutes to 1 hour
    Medium,
    /// Above 1 hour
    Coarse,
}

impl fmt::Display for ResolutionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ResolutionClass::Fine => "fine",
                ResolutionClass::Medium => "medium",
                ResolutionClass::Coarse => "coarse",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported ticker: {0:?}")]
pub struct InvalidTicker(pub String);

/// Exchange symbol in its normalized form, e.g. `BTCUSDT`.
///
/// Keeps the user-facing spelling (`BTC/USDT`) around for display.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Ticker {
    symbol: String,
    display: String,
}

impl Ticker {
    const MAX_LEN: usize = 28;

    pub fn new(raw: &str) -> Result<Self, InvalidTicker> {
        let display = raw.trim().to_ascii_uppercase();
        let symbol: String = display.chars().filter(|c| *c != '/').collect();

        let valid = !symbol.is_empty()
            && symbol.len() <= Self::MAX_LEN
            && symbol.chars().all(|c| c.is_ascii_alphanumeric());

        if !valid || display.matches('/').count() > 1 {
            return Err(InvalidTicker(raw.to_string()));
        }

        Ok(Ticker { symbol, display })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    /// Kline stream name, e.g. `btcusdt@kline_15m`.
    pub fn kline_stream_name(&self, timeframe: Timeframe) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), timeframe)
    }
}

impl FromStr for Ticker {
    type Err = InvalidTicker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ticker::new(s)
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticker({})", self.symbol)
    }
}

impl Serialize for Ticker {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.display)
    }
}

impl<'de> Deserialize<'de> for Ticker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ticker::new(&s).map_err(serde::de::Error::custom)
    }
}

/// One finished or forming OHLCV bar. `time` is the bar open in seconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(time: u64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Live update for the currently forming bar.
///
/// Zero or more partial updates arrive per bar, followed by exactly one with
/// `is_closed` set before the next bar's first update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Tick {
    pub fn to_bar(&self) -> Bar {
        Bar::new(self.time, self.open, self.high, self.low, self.close, self.volume)
    }
}

fn de_string_to_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::String(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("expected finite number")),
        _ => Err(serde::de::Error::custom("expected number as string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trips_exchange_notation() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.to_string().parse::<Timeframe>(), Ok(tf));
        }
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_classes() {
        assert_eq!(Timeframe::M1.class(), ResolutionClass::Fine);
        assert_eq!(Timeframe::M5.class(), ResolutionClass::Fine);
        assert_eq!(Timeframe::M15.class(), ResolutionClass::Medium);
        assert_eq!(Timeframe::H1.class(), ResolutionClass::Medium);
        assert_eq!(Timeframe::H4.class(), ResolutionClass::Coarse);
        assert_eq!(Timeframe::D1.class(), ResolutionClass::Coarse);
    }

    #[test]
    fn ticker_normalizes_pair_notation() {
        let ticker = Ticker::new("btc/usdt").unwrap();
        assert_eq!(ticker.symbol(), "BTCUSDT");
        assert_eq!(ticker.display(), "BTC/USDT");
        assert_eq!(
            ticker.kline_stream_name(Timeframe::M15),
            "btcusdt@kline_15m"
        );

        assert_eq!(Ticker::new("ETHUSDT").unwrap().symbol(), "ETHUSDT");
    }

    #[test]
    fn ticker_rejects_garbage() {
        assert!(Ticker::new("").is_err());
        assert!(Ticker::new("BTC-USDT").is_err());
        assert!(Ticker::new("A/B/C").is_err());
        assert!(Ticker::new(&"X".repeat(40)).is_err());
    }
}
