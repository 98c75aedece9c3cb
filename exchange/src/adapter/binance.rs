use super::{
    super::{
        Bar, MAX_PAGE_LIMIT, Tick, Ticker, Timeframe,
        connect::{self, State, connect_ws},
        de_string_to_f64, resilience,
    },
    AdapterError, BarQuery, HistoryProvider, StreamEvent, TickSource,
};

use fastwebsockets::OpCode;
use serde::{Deserialize, de::DeserializeOwned};
use tokio::sync::mpsc;

use std::{sync::LazyLock, time::Duration};

const REST_DOMAIN: &str = "https://api.binance.com";
const WS_DOMAIN: &str = "stream.binance.com";
const WS_PORT: u16 = 9443;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on bars gathered by one paginated query.
pub const MAX_QUERY_LIMIT: usize = 10_000;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .expect("failed to build HTTP client")
});

/// Binance spot market: REST klines for history, kline stream for live bars.
#[derive(Debug, Clone)]
pub struct Binance {
    reconnect_delay: Duration,
}

impl Binance {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self { reconnect_delay }
    }
}

impl Default for Binance {
    fn default() -> Self {
        Self::new(resilience::LIVE_RECONNECT_DELAY)
    }
}

impl HistoryProvider for Binance {
    async fn get_bars(&self, query: BarQuery) -> Result<Vec<Bar>, AdapterError> {
        fetch_bars(&query).await
    }
}

impl TickSource for Binance {
    fn subscribe(&self, ticker: Ticker, timeframe: Timeframe) -> mpsc::Receiver<StreamEvent> {
        let (output, events) = mpsc::channel(100);
        tokio::spawn(connect_kline_stream(
            ticker,
            timeframe,
            self.reconnect_delay,
            output,
        ));
        events
    }
}

#[derive(Deserialize, Debug, Clone)]
struct FetchedKline(
    u64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    u64,
    String,
    u32,
    String,
    String,
    String,
);

impl From<FetchedKline> for Bar {
    fn from(k: FetchedKline) -> Self {
        let FetchedKline(
            time_ms,
            open,
            high,
            low,
            close,
            volume,
            _close_time,
            _quote_asset_volume,
            _number_of_trades,
            _taker_buy_base_asset_volume,
            _taker_buy_quote_asset_volume,
            _ignore,
        ) = k;

        Bar::new(time_ms / 1_000, open, high, low, close, volume)
    }
}

fn klines_url(
    ticker: &Ticker,
    timeframe: Timeframe,
    end_time: Option<u64>,
    limit: usize,
) -> String {
    let mut url = format!(
        "{REST_DOMAIN}/api/v3/klines?symbol={}&interval={timeframe}&limit={limit}",
        ticker.symbol()
    );

    // exchange endTime is inclusive and in milliseconds
    if let Some(end_time) = end_time {
        let end_ms = end_time.saturating_mul(1_000).saturating_sub(1);
        url.push_str(&format!("&endTime={end_ms}"));
    }

    url
}

/// Walks the klines endpoint backwards in chunks until `limit` bars are gathered
/// or the exchange runs out of history.
pub async fn fetch_bars(query: &BarQuery) -> Result<Vec<Bar>, AdapterError> {
    if query.limit == 0 {
        return Err(AdapterError::InvalidRequest("limit must be positive".to_string()));
    }

    let mut remaining = query.limit.min(MAX_QUERY_LIMIT);
    let mut end_cursor = query.end_time;
    let mut collected: Vec<Bar> = Vec::with_capacity(remaining);

    while remaining > 0 {
        let chunk_size = remaining.min(MAX_PAGE_LIMIT);
        let url = klines_url(&query.ticker, query.timeframe, end_cursor, chunk_size);

        let fetched: Vec<FetchedKline> = http_parse(&url).await?;
        let mut chunk: Vec<Bar> = fetched.into_iter().map(Bar::from).collect();
        chunk.sort_by_key(|bar| bar.time);

        let Some(oldest) = chunk.first().map(|bar| bar.time) else {
            break;
        };
        let chunk_len = chunk.len();

        remaining = remaining.saturating_sub(chunk_len);
        end_cursor = Some(oldest);
        collected.extend(chunk);

        if chunk_len < chunk_size {
            break;
        }
    }

    collected.sort_by_key(|bar| bar.time);
    collected.dedup_by_key(|bar| bar.time);
    if collected.len() > query.limit {
        collected.drain(..collected.len() - query.limit);
    }

    log::debug!(
        "[Binance] fetched {} {} bars before {:?}",
        collected.len(),
        query.ticker,
        query.end_time
    );

    Ok(collected)
}

async fn http_parse<T: DeserializeOwned>(url: &str) -> Result<T, AdapterError> {
    let response = HTTP_CLIENT.get(url).send().await?.error_for_status()?;
    let text = response.text().await?;

    serde_json::from_str(&text).map_err(|e| AdapterError::ParseError(e.to_string()))
}

#[derive(Deserialize, Debug, Clone)]
struct StreamKline {
    #[serde(rename = "t")]
    time: u64,
    #[serde(rename = "o", deserialize_with = "de_string_to_f64")]
    open: f64,
    #[serde(rename = "h", deserialize_with = "de_string_to_f64")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "de_string_to_f64")]
    low: f64,
    #[serde(rename = "c", deserialize_with = "de_string_to_f64")]
    close: f64,
    #[serde(rename = "v", deserialize_with = "de_string_to_f64")]
    volume: f64,
    #[serde(rename = "x")]
    is_closed: bool,
    #[serde(rename = "i")]
    interval: String,
}

#[derive(Deserialize, Debug, Clone)]
struct StreamKlineWrap {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: StreamKline,
}

fn parse_kline_event(
    payload: &[u8],
    ticker: &Ticker,
    timeframe: Timeframe,
) -> Result<Tick, AdapterError> {
    let wrap: StreamKlineWrap =
        serde_json::from_slice(payload).map_err(|e| AdapterError::ParseError(e.to_string()))?;

    if wrap.symbol != ticker.symbol() || wrap.kline.interval != timeframe.to_string() {
        return Err(AdapterError::ParseError(format!(
            "unexpected kline for {}@{}",
            wrap.symbol, wrap.kline.interval
        )));
    }

    let k = wrap.kline;
    Ok(Tick {
        time: k.time / 1_000,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        is_closed: k.is_closed,
    })
}

/// Runs the kline stream for one ticker until `output` is dropped.
pub async fn connect_kline_stream(
    ticker: Ticker,
    timeframe: Timeframe,
    reconnect_delay: Duration,
    output: mpsc::Sender<StreamEvent>,
) {
    let mut state = State::Disconnected;
    let mut backoff = resilience::reconnect_backoff(reconnect_delay);

    let url = format!(
        "wss://{WS_DOMAIN}:{WS_PORT}/ws/{}",
        ticker.kline_stream_name(timeframe)
    );

    loop {
        if output.is_closed() {
            log::debug!("[Binance] kline subscriber for {ticker} dropped, stopping stream");
            return;
        }

        match &mut state {
            State::Disconnected => match connect_ws(WS_DOMAIN, &url).await {
                Ok(websocket) => {
                    state = State::Connected(websocket);
                    backoff = resilience::reconnect_backoff(reconnect_delay);
                    let _ = output.send(StreamEvent::Connected).await;
                }
                Err(err) => {
                    let _ = output
                        .send(StreamEvent::Disconnected(format!(
                            "Failed to connect to websocket: {err}"
                        )))
                        .await;

                    if let Some(delay) = backoff.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
            },
            State::Connected(ws) => {
                let reason =
                    match tokio::time::timeout(connect::WS_READ_TIMEOUT, ws.read_frame()).await {
                        Ok(Ok(msg)) => match msg.opcode {
                            OpCode::Text => {
                                match parse_kline_event(&msg.payload[..], &ticker, timeframe) {
                                    Ok(tick) => {
                                        let _ = output.send(StreamEvent::Tick(tick)).await;
                                    }
                                    Err(err) => log::warn!("[Binance] {err}"),
                                }
                                None
                            }
                            OpCode::Close => Some("Connection closed".to_string()),
                            _ => None,
                        },
                        Ok(Err(e)) => Some(format!("Error reading frame: {e}")),
                        Err(_elapsed) => {
                            log::warn!("[Binance] kline read timeout, reconnecting");
                            Some("Read timeout (connection stale)".to_string())
                        }
                    };

                if let Some(reason) = reason {
                    state = State::Disconnected;
                    let _ = output.send(StreamEvent::Disconnected(reason)).await;

                    if let Some(delay) = backoff.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
