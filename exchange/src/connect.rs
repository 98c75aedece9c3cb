use crate::adapter::AdapterError;

use bytes::Bytes;
use fastwebsockets::FragmentCollector;
use http_body_util::Empty;
use hyper::{
    Request,
    header::{CONNECTION, HOST, UPGRADE},
    upgrade::Upgraded,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName},
};
use url::Url;

use std::{
    future::Future,
    sync::{Arc, LazyLock},
    time::Duration,
};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum idle time before considering a kline stream dead.
/// Binance pushes kline updates every ~2s while a bar is forming, so 45s of silence
/// means a half-open TCP connection rather than a quiet market.
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(45);

pub type WsStream = FragmentCollector<TokioIo<Upgraded>>;

static TLS_CONNECTOR: LazyLock<TlsConnector> = LazyLock::new(|| {
    let mut root_store = RootCertStore::empty();

    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
});

pub enum State {
    Disconnected,
    Connected(WsStream),
}

/// Validated pieces of a `ws://` or `wss://` URL needed for the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WsEndpoint {
    host: String,
    port: u16,
    secure: bool,
    path_and_query: String,
}

impl WsEndpoint {
    fn parse(domain: &str, url: &str) -> Result<Self, AdapterError> {
        let parsed = Url::parse(url).map_err(|e| AdapterError::InvalidRequest(e.to_string()))?;

        let secure = match parsed.scheme() {
            "wss" => true,
            "ws" => false,
            other => {
                return Err(AdapterError::InvalidRequest(format!(
                    "Invalid scheme for websocket URL: {other}"
                )));
            }
        };

        let host = parsed.host_str().ok_or_else(|| {
            AdapterError::InvalidRequest("Missing host in websocket URL".to_string())
        })?;

        if !host.eq_ignore_ascii_case(domain) {
            return Err(AdapterError::InvalidRequest(format!(
                "WebSocket URL host mismatch: url_host={host}, domain_arg={domain}"
            )));
        }

        let port = parsed.port_or_known_default().ok_or_else(|| {
            AdapterError::InvalidRequest("Missing port for websocket URL".to_string())
        })?;

        let mut path_and_query = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }

        Ok(Self {
            host: domain.to_string(),
            port,
            secure,
            path_and_query,
        })
    }

    fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };

        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AdapterError::WebsocketError(format!("{what} timed out")))?
}

pub async fn connect_ws(domain: &str, url: &str) -> Result<WsStream, AdapterError> {
    let endpoint = WsEndpoint::parse(domain, url)?;

    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let tcp = with_timeout(TCP_CONNECT_TIMEOUT, "TCP connect", async {
        TcpStream::connect(&addr)
            .await
            .map_err(|e| AdapterError::WebsocketError(e.to_string()))
    })
    .await?;

    if endpoint.secure {
        let tls = with_timeout(
            TLS_HANDSHAKE_TIMEOUT,
            "TLS handshake",
            upgrade_to_tls(&endpoint.host, tcp),
        )
        .await?;

        with_timeout(
            WS_HANDSHAKE_TIMEOUT,
            "WebSocket handshake",
            upgrade_to_websocket(&endpoint, tls),
        )
        .await
    } else {
        with_timeout(
            WS_HANDSHAKE_TIMEOUT,
            "WebSocket handshake",
            upgrade_to_websocket(&endpoint, tcp),
        )
        .await
    }
}

async fn upgrade_to_tls(
    domain: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, AdapterError> {
    let server_name = ServerName::try_from(domain)
        .map_err(|_| AdapterError::ParseError("invalid dnsname".to_string()))?;

    TLS_CONNECTOR
        .connect(server_name, stream)
        .await
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))
}

async fn upgrade_to_websocket<S>(
    endpoint: &WsEndpoint,
    stream: S,
) -> Result<WsStream, AdapterError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let req: Request<Empty<Bytes>> = Request::builder()
        .method("GET")
        .uri(endpoint.path_and_query.as_str())
        .header(HOST, endpoint.host_header())
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(
            "Sec-WebSocket-Key",
            fastwebsockets::handshake::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .body(Empty::<Bytes>::new())
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    let (ws, _) = fastwebsockets::handshake::client(&TokioExecutor::new(), req, stream)
        .await
        .map_err(|e| AdapterError::WebsocketError(e.to_string()))?;

    Ok(FragmentCollector::new(ws))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_explicit_port_in_host_header() {
        let endpoint = WsEndpoint::parse(
            "stream.binance.com",
            "wss://stream.binance.com:9443/ws/btcusdt@kline_1m",
        )
        .unwrap();

        assert!(endpoint.secure);
        assert_eq!(endpoint.port, 9443);
        assert_eq!(endpoint.path_and_query, "/ws/btcusdt@kline_1m");
        assert_eq!(endpoint.host_header(), "stream.binance.com:9443");
    }

    #[test]
    fn endpoint_omits_default_port() {
        let endpoint = WsEndpoint::parse("example.com", "ws://example.com/feed?x=1").unwrap();

        assert!(!endpoint.secure);
        assert_eq!(endpoint.port, 80);
        assert_eq!(endpoint.path_and_query, "/feed?x=1");
        assert_eq!(endpoint.host_header(), "example.com");
    }

    #[test]
    fn endpoint_rejects_mismatched_host_and_scheme() {
        assert!(WsEndpoint::parse("a.com", "wss://b.com/ws").is_err());
        assert!(WsEndpoint::parse("a.com", "https://a.com/ws").is_err());
    }
}
