//! Message-oriented transports
//!
//! The session layer only needs a bidirectional text stream: send a
//! frame, receive a frame, close. `WsTransport` provides that over
//! tokio-tungstenite for both the connecting (charge point) and the
//! accepting (central system) end, negotiating the OCPP subprotocol
//! during the handshake. `mem::pair` provides a loopback pair for tests
//! and demos.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_hdr_async, connect_async_with_config,
    tungstenite::{
        handshake::client::{generate_key, Request},
        handshake::server,
        http::{header, HeaderValue, StatusCode, Uri},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

/// OCPP 2.0.1 WebSocket subprotocol token
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Message and frame size caps for OCPP traffic
const MAX_MESSAGE_SIZE: usize = 64 * 1024;
const MAX_FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("subprotocol negotiation failed: {0}")]
    SubprotocolMismatch(String),

    #[error("transport closed")]
    Closed,
}

/// A bidirectional, message-oriented text transport.
///
/// `receive` yields `None` once the peer has closed; an `Err` item is a
/// transport fault and terminates the session that owns this transport.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn receive(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket-backed transport. Text frames pass through; ping/pong and
/// binary frames are skipped; a Close frame ends the stream.
#[derive(Debug)]
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

#[async_trait]
impl<S> MessageTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pongs are produced by tungstenite itself.
                    debug!("skipping ping/pong frame");
                }
                Ok(other) => {
                    debug!(?other, "skipping non-text frame");
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match self.inner.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

/// Build the endpoint URL a charge point dials: base URL plus station id.
pub fn endpoint_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

/// Connect to a central system, requesting `subprotocol`.
///
/// A server that does not echo the requested subprotocol failed the
/// negotiation; the socket is closed and an error returned rather than
/// proceeding without one.
pub async fn connect(
    url: &str,
    subprotocol: &str,
) -> Result<WsTransport<MaybeTlsStream<TcpStream>>, TransportError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| TransportError::InvalidEndpoint(url.to_string()))?;
    let host = uri
        .host()
        .ok_or_else(|| TransportError::InvalidEndpoint(url.to_string()))?
        .to_string();

    let request = Request::builder()
        .uri(url)
        .header(header::SEC_WEBSOCKET_PROTOCOL, subprotocol)
        .header(header::HOST, host)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, generate_key())
        .body(())
        .map_err(|_| TransportError::InvalidEndpoint(url.to_string()))?;

    let (mut ws, response) = connect_async_with_config(request, Some(ws_config()), false).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());

    if accepted != Some(subprotocol) {
        warn!(requested = subprotocol, ?accepted, "server did not accept subprotocol");
        let _ = ws.close(None).await;
        return Err(TransportError::SubprotocolMismatch(format!(
            "requested {}, server offered {:?}",
            subprotocol, accepted
        )));
    }

    info!(url, subprotocol, "websocket connected");
    Ok(WsTransport { inner: ws })
}

/// What the server learned during a successful handshake.
#[derive(Debug, Clone)]
pub struct AcceptInfo {
    /// Request path; by OCPP-J convention the trailing segment is the
    /// station identity.
    pub path: String,
    /// The negotiated subprotocol token.
    pub subprotocol: String,
}

impl AcceptInfo {
    /// Station identity from the request path.
    pub fn station_id(&self) -> &str {
        self.path.trim_matches('/').rsplit('/').next().unwrap_or("")
    }
}

/// Accept one WebSocket connection, negotiating a subprotocol.
///
/// A client that offers none of `supported` — or no subprotocol at all —
/// is rejected with HTTP 400 before the WebSocket opens.
pub async fn accept(
    stream: TcpStream,
    supported: &[&str],
) -> Result<(WsTransport<TcpStream>, AcceptInfo), TransportError> {
    let mut path = String::new();
    let mut negotiated: Option<String> = None;

    let ws = accept_hdr_async(stream, |req: &server::Request, mut resp: server::Response| {
        path = req.uri().path().to_string();

        let offered: Vec<String> = req
            .headers()
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if offered.is_empty() {
            warn!(path = %path, "client requested no subprotocol, rejecting");
            return Err(reject("no subprotocol requested"));
        }

        let chosen = offered
            .iter()
            .find(|t| supported.contains(&t.as_str()))
            .cloned();

        match chosen {
            Some(token) => {
                let value = HeaderValue::from_str(&token)
                    .map_err(|_| reject("unusable subprotocol token"))?;
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                negotiated = Some(token);
                Ok(resp)
            }
            None => {
                warn!(
                    path = %path,
                    offered = ?offered,
                    supported = ?supported,
                    "subprotocol mismatch, rejecting"
                );
                Err(reject("no mutually supported subprotocol"))
            }
        }
    })
    .await
    .map_err(|e| match e {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            let reason = resp
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .unwrap_or_else(|| "handshake rejected".to_string());
            TransportError::SubprotocolMismatch(reason)
        }
        other => TransportError::Ws(other),
    })?;

    let info = AcceptInfo {
        path,
        // The callback ran to completion, so negotiation succeeded.
        subprotocol: negotiated.unwrap_or_default(),
    };
    info!(path = %info.path, subprotocol = %info.subprotocol, "websocket accepted");

    Ok((WsTransport { inner: ws }, info))
}

fn reject(reason: &str) -> server::ErrorResponse {
    let mut resp = server::ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

/// In-memory loopback transport.
pub mod mem {
    use super::{MessageTransport, TransportError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// One end of a loopback pair.
    pub struct MemTransport {
        tx: Option<mpsc::Sender<String>>,
        rx: mpsc::Receiver<String>,
    }

    /// Create a connected pair of in-memory transports.
    pub fn pair(capacity: usize) -> (MemTransport, MemTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            MemTransport {
                tx: Some(a_tx),
                rx: b_rx,
            },
            MemTransport {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    #[async_trait]
    impl MessageTransport for MemTransport {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            match &self.tx {
                Some(tx) => tx.send(text).await.map_err(|_| TransportError::Closed),
                None => Err(TransportError::Closed),
            }
        }

        async fn receive(&mut self) -> Option<Result<String, TransportError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.tx = None;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("ws://localhost:9000", "EK3-001"),
            "ws://localhost:9000/EK3-001"
        );
        assert_eq!(
            endpoint_url("ws://localhost:9000/", "EK3-001"),
            "ws://localhost:9000/EK3-001"
        );
    }

    #[test]
    fn test_station_id_from_path() {
        let info = AcceptInfo {
            path: "/csms/EK3-001".into(),
            subprotocol: OCPP_SUBPROTOCOL.into(),
        };
        assert_eq!(info.station_id(), "EK3-001");

        let bare = AcceptInfo {
            path: "/CP_1".into(),
            subprotocol: OCPP_SUBPROTOCOL.into(),
        };
        assert_eq!(bare.station_id(), "CP_1");
    }

    #[tokio::test]
    async fn test_mem_pair_roundtrip() {
        let (mut a, mut b) = mem::pair(8);
        a.send("hello".into()).await.unwrap();
        assert_eq!(b.receive().await.unwrap().unwrap(), "hello");

        b.send("world".into()).await.unwrap();
        assert_eq!(a.receive().await.unwrap().unwrap(), "world");

        a.close().await.unwrap();
        assert!(a.send("late".into()).await.is_err());
        assert!(b.receive().await.is_none());
    }
}
