//! In-process WebSocket backend for integration tests.
//!
//! Every accepted socket is handed to the test as a [`Peer`], tagged with the
//! request path and `Authorization` header seen during the handshake.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// One accepted client socket.
pub struct Peer {
    pub path: String,
    pub authorization: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

impl Peer {
    /// Next JSON text frame, or `None` once the client closed.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame")?;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).expect("client sent JSON"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Send one JSON text frame.
    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::text(value.to_string()))
            .await
            .expect("send to client");
    }

    /// Send one JSON text frame, tolerating a client that already left.
    pub async fn try_send_json(&mut self, value: Value) -> bool {
        self.ws.send(Message::text(value.to_string())).await.is_ok()
    }

    /// Send a raw text frame.
    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::text(text.to_string()))
            .await
            .expect("send to client");
    }

    /// Drop the TCP connection without a close handshake.
    pub fn drop_abruptly(self) {
        drop(self.ws);
    }
}

/// Accepts WebSocket clients on an ephemeral local port.
pub struct MockBackend {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<Peer>,
    accepted: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, peers) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let seen = Arc::new(Mutex::new((String::new(), None::<String>)));
                    let record = Arc::clone(&seen);
                    let callback = move |request: &Request, response: Response| {
                        let authorization = request
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        *record.lock() = (request.uri().path().to_string(), authorization);
                        Ok::<Response, ErrorResponse>(response)
                    };
                    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                        let (path, authorization) = seen.lock().clone();
                        let _ = tx.send(Peer {
                            path,
                            authorization,
                            ws,
                        });
                    }
                });
            }
        });

        Self {
            addr,
            peers,
            accepted,
        }
    }

    /// `http://` base address, as a config would hold it.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// `ws://` URL for `path`.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Next accepted client.
    pub async fn accept(&mut self) -> Peer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a client")
            .expect("backend stopped")
    }

    /// Next accepted client, if one arrives within `within`.
    pub async fn try_accept(&mut self, within: Duration) -> Option<Peer> {
        tokio::time::timeout(within, self.peers.recv()).await.ok().flatten()
    }

    /// TCP connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// An address nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future`, failing the test after [`WAIT`].
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}
