//! Raw WebSocket halves.
//!
//! The only place that touches `tokio-tungstenite` directly. [`connect`]
//! performs the handshake with the caller's headers and hands back a
//! ([`WsWriter`], [`WsReader`]) pair suitable for a `tokio::select!` loop.
//! Everything above this module speaks JSON text frames.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, http};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// One inbound frame, already reduced to what the transport cares about.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// UTF-8 text (binary frames are decoded lossily into this too).
    Text(String),
    /// Ping that must be answered.
    Ping(Vec<u8>),
    /// Peer closed the socket.
    Close {
        /// WebSocket close code (1005 when the peer sent none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::text(text))
            .await
            .context("WebSocket send failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data.into()))
            .await
            .context("WebSocket pong failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        // The peer may already be gone; the close frame is best effort.
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Next meaningful frame, or `None` once the stream has ended.
    ///
    /// Pongs and raw frames are skipped.
    pub async fn recv(&mut self) -> Option<Result<Inbound>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            match message {
                tungstenite::Message::Text(text) => return Some(Ok(Inbound::Text(text.to_string()))),
                tungstenite::Message::Binary(data) => {
                    return Some(Ok(Inbound::Text(String::from_utf8_lossy(&data).into_owned())));
                }
                tungstenite::Message::Ping(data) => return Some(Ok(Inbound::Ping(data.to_vec()))),
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame
                        .map_or((1005, String::new()), |cf| (cf.code.into(), cf.reason.to_string()));
                    return Some(Ok(Inbound::Close { code, reason }));
                }
                tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => {}
            }
        }
    }
}

/// Open a WebSocket to `url`, inserting each `(name, value)` header into the
/// handshake request.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<(WsWriter, WsReader)> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for (name, value) in headers {
        let header_name = http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;
    let (sink, stream) = stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to the matching WS(S) scheme.
///
/// `ws://` and `wss://` pass through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
