//! Transport Connection: one physical socket with reconnection.
//!
//! [`Connection::open`] spawns a background task that owns the socket and
//! returns a cheap, cloneable handle plus an event receiver. The task:
//!
//! 1. Connects to the endpoint (failures are reported, then retried per policy)
//! 2. Publishes [`ConnectionEvent::Opened`] and flips the state to `Open`
//! 3. Parses every inbound text frame as JSON and forwards it; unparseable
//!    frames are logged and dropped
//! 4. Writes outbound frames in submission order
//! 5. On unexpected loss, schedules exactly one reconnection attempt after the
//!    policy's delay
//!
//! # Writes
//!
//! [`Connection::send_text`] fails with [`Error::NotConnected`] unless the
//! state is `Open`, and with [`Error::QueueFull`] once
//! [`constants::OUTBOUND_QUEUE_CAPACITY`] frames are waiting for the socket.
//! Frames accepted just before a loss are discarded with the dead socket,
//! never replayed on the next one.
//!
//! # Backpressure
//!
//! Inbound events go through a channel of [`constants::EVENT_QUEUE_CAPACITY`].
//! When the consumer falls behind, the task stops reading the socket until
//! there is room again.
//!
//! # Shutdown
//!
//! [`Connection::close`] cancels any pending reconnect and moves to the
//! terminal `Closed` state. Dropping the event receiver has the same effect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::error::{Error, Result};
use crate::ws::{self, Inbound, WsReader, WsWriter, ABNORMAL_CLOSE};

/// Close code reported when the client closed the socket itself.
const NORMAL_CLOSE: u16 = 1000;

/// How long to wait before each reconnection attempt.
///
/// `attempt` counts consecutive failures since the last successful open,
/// starting at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay every time, retry forever.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Doubling delay capped at `max_ms`.
    Exponential {
        /// First delay in milliseconds.
        initial_ms: u64,
        /// Cap in milliseconds.
        max_ms: u64,
    },
    /// Fixed delay plus uniform random jitter.
    Jittered {
        /// Base delay in milliseconds.
        delay_ms: u64,
        /// Maximum extra delay in milliseconds.
        jitter_ms: u64,
    },
    /// Never reconnect; a loss is final.
    Never,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay_ms: constants::DEFAULT_RECONNECT_DELAY.as_millis() as u64,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt, or `None` if no attempt should follow.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Fixed { delay_ms } => Some(Duration::from_millis(delay_ms)),
            Self::Exponential { initial_ms, max_ms } => {
                let factor = 1u64 << attempt.min(32);
                Some(Duration::from_millis(
                    initial_ms.saturating_mul(factor).min(max_ms),
                ))
            }
            Self::Jittered {
                delay_ms,
                jitter_ms,
            } => {
                let jitter = if jitter_ms == 0 {
                    0
                } else {
                    rand::random_range(0..=jitter_ms)
                };
                Some(Duration::from_millis(delay_ms.saturating_add(jitter)))
            }
            Self::Never => None,
        }
    }
}

/// Liveness of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Socket is live; `generation` counts successful handshakes.
    Open {
        /// Handshake number, starting at 1.
        generation: u64,
    },
    /// Waiting out the delay before the next attempt.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Delay until the next attempt.
        retry_in: Duration,
    },
    /// Socket dropped; the reconnect decision has not been made yet.
    Disconnected,
    /// Terminal state after `close()` or when the policy gives up.
    Closed,
}

impl ConnectionState {
    /// Whether frames can be sent.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Notification emitted by the connection task, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Opened {
        /// Handshake number.
        generation: u64,
    },
    /// One parsed inbound JSON frame.
    Frame(Value),
    /// An open socket ended.
    Closed {
        /// Generation that ended.
        generation: u64,
        /// WebSocket close code.
        code: u16,
        /// Close reason or error text.
        reason: String,
        /// Delay before the scheduled reconnect; `None` if none follows.
        retry_in: Option<Duration>,
    },
    /// A connection attempt failed before the handshake completed.
    ConnectFailed {
        /// Error text.
        error: String,
        /// Delay before the scheduled retry; `None` if none follows.
        retry_in: Option<Duration>,
    },
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Extra handshake headers (e.g. `Authorization`).
    pub headers: Vec<(String, String)>,
    /// Reconnection behaviour.
    pub reconnect: ReconnectPolicy,
}

impl ConnectOptions {
    /// Options for `url` with no headers and the default policy.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Set handshake headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[derive(Debug)]
struct Shared {
    url: String,
    state: watch::Sender<ConnectionState>,
    outgoing: mpsc::Sender<String>,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        // Once closed, only the terminal state may be written.
        if self.shutdown.is_cancelled() && !state.is_closed() {
            return;
        }
        self.state.send_replace(state);
    }
}

/// Handle to one physical socket. Clones share the socket.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start connecting in the background.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(options: ConnectOptions) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(constants::OUTBOUND_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(constants::EVENT_QUEUE_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let shared = Arc::new(Shared {
            url: options.url.clone(),
            state,
            outgoing: outgoing_tx,
            shutdown: CancellationToken::new(),
            generation: AtomicU64::new(0),
        });

        tokio::spawn(run_connection_loop(
            Arc::clone(&shared),
            options,
            outgoing_rx,
            events_tx,
        ));

        (Self { shared }, events_rx)
    }

    /// Endpoint this connection targets.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Current liveness.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Whether frames can be sent right now.
    pub fn is_open(&self) -> bool {
        self.shared.state.borrow().is_open()
    }

    /// Number of successful handshakes so far.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Wait until the socket is open.
    ///
    /// Fails with [`Error::NotConnected`] if the connection reaches `Closed`
    /// first.
    pub async fn wait_open(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|s| s.is_open() || s.is_closed())
            .await
            .map_err(|_closed| Error::NotConnected)?;
        if state.is_open() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Queue a text frame for the live socket.
    pub fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        self.shared.outgoing.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::NotConnected,
        })
    }

    /// Serialize `frame` as JSON and queue it.
    pub fn send_frame<T: Serialize>(&self, frame: &T) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.send_text(text)
    }

    /// Close for good. Idempotent.
    pub fn close(&self) {
        if !self.shared.shutdown.is_cancelled() {
            log::debug!("[Connection] Closing {}", self.shared.url);
        }
        self.shared.shutdown.cancel();
        self.shared.set_state(ConnectionState::Closed);
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

/// Why a live socket's message loop ended.
enum LoopExit {
    /// `close()` was called.
    Shutdown,
    /// Nobody is listening for events any more.
    ReceiverDropped,
    /// The socket failed or the peer closed it.
    Lost { code: u16, reason: String },
}

/// Connect, pump, and reconnect until shut down.
async fn run_connection_loop(
    shared: Arc<Shared>,
    options: ConnectOptions,
    mut outgoing_rx: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        log::debug!("[Connection] Connecting to {}", options.url);

        let connected = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            result = ws::connect(&options.url, &options.headers) => result,
        };

        let retry_in = match connected {
            Ok((mut writer, mut reader)) => {
                attempt = 0;
                discard_stale_writes(&mut outgoing_rx, &options.url);
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                shared.set_state(ConnectionState::Open { generation });
                log::info!(
                    "[Connection] Open {} (generation {})",
                    options.url,
                    generation
                );

                if events_tx
                    .send(ConnectionEvent::Opened { generation })
                    .await
                    .is_err()
                {
                    let _ = writer.close().await;
                    break;
                }

                match run_message_loop(&shared, &mut writer, &mut reader, &mut outgoing_rx, &events_tx)
                    .await
                {
                    LoopExit::Shutdown => {
                        let _ = writer.close().await;
                        // Best effort: a stalled consumer must not hold up close().
                        let _ = events_tx.try_send(ConnectionEvent::Closed {
                            generation,
                            code: NORMAL_CLOSE,
                            reason: "closed by client".to_string(),
                            retry_in: None,
                        });
                        break;
                    }
                    LoopExit::ReceiverDropped => {
                        log::debug!("[Connection] Event receiver dropped, closing {}", options.url);
                        let _ = writer.close().await;
                        break;
                    }
                    LoopExit::Lost { code, reason } => {
                        shared.set_state(ConnectionState::Disconnected);
                        discard_stale_writes(&mut outgoing_rx, &options.url);
                        let retry_in = options.reconnect.delay_for(attempt);
                        log::warn!(
                            "[Connection] Lost {} (code {}: {}), retry in {:?}",
                            options.url,
                            code,
                            reason,
                            retry_in
                        );
                        let closed = ConnectionEvent::Closed {
                            generation,
                            code,
                            reason,
                            retry_in,
                        };
                        if events_tx.send(closed).await.is_err() {
                            break;
                        }
                        retry_in
                    }
                }
            }
            Err(e) => {
                let retry_in = options.reconnect.delay_for(attempt);
                log::warn!(
                    "[Connection] Connect to {} failed: {:#} (retry in {:?})",
                    options.url,
                    e,
                    retry_in
                );
                let failed = ConnectionEvent::ConnectFailed {
                    error: format!("{e:#}"),
                    retry_in,
                };
                if events_tx.send(failed).await.is_err() {
                    break;
                }
                retry_in
            }
        };

        let Some(delay) = retry_in else {
            log::info!("[Connection] Not reconnecting to {}", options.url);
            break;
        };

        attempt = attempt.saturating_add(1);
        shared.set_state(ConnectionState::Reconnecting {
            attempt,
            retry_in: delay,
        });

        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.shutdown.cancel();
    shared.set_state(ConnectionState::Closed);
}

/// Pump one live socket until it ends.
async fn run_message_loop(
    shared: &Shared,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    outgoing_rx: &mut mpsc::Receiver<String>,
    events_tx: &mpsc::Sender<ConnectionEvent>,
) -> LoopExit {
    loop {
        tokio::select! {
            biased;

            () = shared.shutdown.cancelled() => return LoopExit::Shutdown,

            Some(text) = outgoing_rx.recv() => {
                if let Err(e) = writer.send_text(text).await {
                    return LoopExit::Lost { code: ABNORMAL_CLOSE, reason: format!("{e:#}") };
                }
            }

            frame = reader.recv() => match frame {
                Some(Ok(Inbound::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        let forwarded = tokio::select! {
                            biased;
                            () = shared.shutdown.cancelled() => return LoopExit::Shutdown,
                            sent = events_tx.send(ConnectionEvent::Frame(value)) => sent,
                        };
                        if forwarded.is_err() {
                            return LoopExit::ReceiverDropped;
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "[Connection] Dropping malformed frame from {} ({}): {}",
                            shared.url,
                            e,
                            preview(&text)
                        );
                    }
                },
                Some(Ok(Inbound::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        return LoopExit::Lost { code: ABNORMAL_CLOSE, reason: format!("{e:#}") };
                    }
                }
                Some(Ok(Inbound::Close { code, reason })) => {
                    return LoopExit::Lost { code, reason };
                }
                Some(Err(e)) => {
                    return LoopExit::Lost { code: ABNORMAL_CLOSE, reason: format!("{e:#}") };
                }
                None => {
                    return LoopExit::Lost { code: ABNORMAL_CLOSE, reason: "stream ended".to_string() };
                }
            },
        }
    }
}

/// Drop frames queued for a socket that is gone.
fn discard_stale_writes(outgoing_rx: &mut mpsc::Receiver<String>, url: &str) {
    let mut dropped = 0usize;
    while outgoing_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        log::debug!("[Connection] Discarded {} unsent frame(s) for {}", dropped, url);
    }
}

/// First 120 characters of a frame, for log lines.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
