use super::{Bar, Tick, Ticker, Timeframe};

use std::future::Future;
use tokio::sync::mpsc;

pub mod binance;

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("{0}")]
    FetchError(#[from] reqwest::Error),
    #[error("Parsing: {0}")]
    ParseError(String),
    #[error("Stream: {0}")]
    WebsocketError(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Historical page request: bars strictly older than `end_time` when given,
/// newest-first truncated to `limit`, returned in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarQuery {
    pub ticker: Ticker,
    pub timeframe: Timeframe,
    pub end_time: Option<u64>,
    pub limit: usize,
}

impl BarQuery {
    pub fn latest(ticker: Ticker, timeframe: Timeframe, limit: usize) -> Self {
        Self {
            ticker,
            timeframe,
            end_time: None,
            limit,
        }
    }

    pub fn before(ticker: Ticker, timeframe: Timeframe, end_time: u64, limit: usize) -> Self {
        Self {
            ticker,
            timeframe,
            end_time: Some(end_time),
            limit,
        }
    }
}

/// Paginated historical bar source.
///
/// Implementations own their timeouts; callers treat any error like an empty page.
pub trait HistoryProvider: Send + Sync + 'static {
    fn get_bars(
        &self,
        query: BarQuery,
    ) -> impl Future<Output = Result<Vec<Bar>, AdapterError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Disconnected(String),
    Tick(Tick),
}

/// Push feed of forming-bar updates.
///
/// The returned receiver yields events until it is dropped; reconnection is the
/// source's responsibility and never ends the subscription on its own.
pub trait TickSource: Send + Sync + 'static {
    fn subscribe(&self, ticker: Ticker, timeframe: Timeframe) -> mpsc::Receiver<StreamEvent>;
}
