//! RPC Façade over one shared Transport Connection.
//!
//! # Request flow
//!
//! ```text
//! call(command, payload)
//!   1. allocate correlation id, register in PendingTable
//!   2. send {"type": command, "id": id, "data": payload}
//!   3. wait for: matching response | deadline | cancel token
//!
//! inbound frame (pump task)
//!   id matches pending  → complete that request
//!   otherwise           → EventRouter::dispatch
//!
//! connection generation g closed
//!   → every request sent on g is rejected with Disconnected
//! ```
//!
//! [`RpcClient::notify`] is the fire-and-forget variant: same wire contract,
//! but failures go to the client's single [`NotifyErrorHook`] instead of a
//! caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pending::PendingTable;
use crate::config::Config;
use crate::connection::{ConnectOptions, Connection, ConnectionEvent, ConnectionState};
use crate::envelope::{CorrelationId, Envelope, EnvelopeKind};
use crate::error::{Error, Result};
use crate::events::{Event, EventRouter, TopicFilter};
use crate::listeners::Subscription;

/// Receives `(command, error)` for every failed [`RpcClient::notify`].
pub type NotifyErrorHook = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Give up after this long. Overrides the client default.
    pub timeout: Option<Duration>,
    /// Give up when this token is cancelled.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Bound the call by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abandon the call when `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    options: ConnectOptions,
    default_timeout: Option<Duration>,
    router: Option<EventRouter>,
    notify_hook: Option<NotifyErrorHook>,
}

impl std::fmt::Debug for RpcClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientBuilder")
            .field("url", &self.options.url)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl RpcClientBuilder {
    /// Deadline applied to calls that don't set their own.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Share an existing router instead of creating one.
    #[must_use]
    pub fn router(mut self, router: EventRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Replace the default notify failure hook (a `log::warn!`).
    #[must_use]
    pub fn notify_hook(mut self, hook: NotifyErrorHook) -> Self {
        self.notify_hook = Some(hook);
        self
    }

    /// Build the client. Nothing connects until [`RpcClient::start`].
    pub fn build(self) -> RpcClient {
        let notify_hook = self.notify_hook.unwrap_or_else(|| {
            Arc::new(|command: &str, error: &Error| {
                log::warn!("[Rpc] notify '{}' failed: {}", command, error);
            })
        });
        RpcClient {
            inner: Arc::new(Inner {
                options: self.options,
                default_timeout: self.default_timeout,
                next_id: AtomicU64::new(0),
                pending: PendingTable::new(),
                router: self.router.unwrap_or_default(),
                connection: Mutex::new(None),
                pump: Mutex::new(None),
                notify_hook,
            }),
        }
    }
}

struct Inner {
    options: ConnectOptions,
    default_timeout: Option<Duration>,
    next_id: AtomicU64,
    pending: PendingTable,
    router: EventRouter,
    connection: Mutex<Option<Connection>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    notify_hook: NotifyErrorHook,
}

/// Request/response and event client. Clones share one connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.inner.options.url)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Start building a client for `options`.
    pub fn builder(options: ConnectOptions) -> RpcClientBuilder {
        RpcClientBuilder {
            options,
            default_timeout: None,
            router: None,
            notify_hook: None,
        }
    }

    /// Client for the RPC socket described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let options = ConnectOptions::new(config.rpc_url()?)
            .with_headers(config.auth_headers())
            .with_reconnect(config.reconnect.clone());
        Ok(Self::builder(options)
            .default_timeout(config.request_timeout())
            .build())
    }

    /// Open the connection and start routing inbound frames.
    ///
    /// Calling `start` on a running client does nothing. Must be called
    /// inside a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.inner.connection.lock();
        if slot.as_ref().is_some_and(|conn| !conn.is_closed()) {
            return;
        }

        let (connection, events) = Connection::open(self.inner.options.clone());
        let pump = tokio::spawn(run_pump(
            events,
            self.inner.pending.clone(),
            self.inner.router.clone(),
        ));
        *slot = Some(connection);

        if let Some(previous) = self.inner.pump.lock().replace(pump) {
            previous.abort();
        }
        log::info!("[Rpc] Started client for {}", self.inner.options.url);
    }

    /// Close the connection and reject everything still pending.
    pub async fn stop(&self) {
        let connection = self.inner.connection.lock().take();
        if let Some(connection) = connection {
            connection.close();
        }

        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        let rejected = self.inner.pending.fail_all();
        if rejected > 0 {
            log::info!("[Rpc] Stopped with {} pending request(s) rejected", rejected);
        }
    }

    /// Current liveness of the underlying connection.
    pub fn state(&self) -> ConnectionState {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map_or(ConnectionState::Closed, Connection::state)
    }

    /// Wait until the connection is open.
    pub async fn wait_connected(&self) -> Result<()> {
        let connection = self.connection()?;
        connection.wait_open().await
    }

    /// The router receiving unclaimed inbound envelopes.
    pub fn events(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Shorthand for `self.events().on(filter, handler)`.
    pub fn on<F>(&self, filter: impl Into<TopicFilter>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.router.on(filter, handler)
    }

    /// Shorthand for `self.events().stream(filter)`.
    pub fn subscribe(
        &self,
        filter: impl Into<TopicFilter>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        self.inner.router.stream(filter)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send `command` and wait for its result.
    pub async fn call(&self, command: &str, payload: Value) -> Result<Value> {
        self.call_with(command, payload, CallOptions::default())
            .await
    }

    /// Send `command` and deserialize its result.
    pub async fn call_as<T: DeserializeOwned>(&self, command: &str, payload: Value) -> Result<T> {
        let value = self.call(command, payload).await?;
        serde_json::from_value(value).map_err(|e| {
            Error::MalformedFrame(format!("unexpected result for '{command}': {e}"))
        })
    }

    /// Send `command` with a deadline and/or cancellation token.
    ///
    /// Exactly one outcome is returned. If the response and the deadline race,
    /// whichever removes the table entry first wins.
    pub async fn call_with(
        &self,
        command: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<Value> {
        let connection = self.connection()?;
        let id = CorrelationId::from(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut rx = self
            .inner
            .pending
            .insert(id.clone(), command, connection.generation());
        let _entry = PendingEntryGuard {
            pending: &self.inner.pending,
            id: id.clone(),
        };

        let envelope = Envelope::request(id.clone(), command, payload);
        connection.send_frame(&envelope.to_wire())?;
        log::trace!("[Rpc] -> {} (id {})", command, id);

        let timeout = options.timeout.or(self.inner.default_timeout);
        let gave_up = tokio::select! {
            biased;
            outcome = &mut rx => return outcome.unwrap_or(Err(Error::Disconnected)),
            () = sleep_or_forever(timeout) => Error::Timeout(timeout.unwrap_or_default()),
            () = cancelled_or_forever(options.cancel.as_ref()) => Error::Cancelled,
        };

        // A no-op if the response already removed the entry; its outcome is
        // then in the channel instead.
        self.inner.pending.reject(&id, gave_up);
        rx.await.unwrap_or(Err(Error::Disconnected))
    }

    /// Best-effort call: the result is discarded and failures are reported
    /// through the notify hook.
    pub fn notify(&self, command: &str, payload: Value) {
        let client = self.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.call(&command, payload).await {
                (client.inner.notify_hook)(&command, &e);
            }
        });
    }

    fn connection(&self) -> Result<Connection> {
        self.inner
            .connection
            .lock()
            .clone()
            .ok_or(Error::NotConnected)
    }
}

/// Drops a request's table entry if its caller stops waiting before any
/// outcome arrives.
struct PendingEntryGuard<'a> {
    pending: &'a PendingTable,
    id: CorrelationId,
}

impl Drop for PendingEntryGuard<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.id) {
            log::debug!("[Rpc] Request {} abandoned by its caller", self.id);
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn cancelled_or_forever(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Route connection events: responses to the table, the rest to the router.
async fn run_pump(
    mut events: mpsc::Receiver<ConnectionEvent>,
    pending: PendingTable,
    router: EventRouter,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Opened { generation } => {
                log::info!("[Rpc] Connected (generation {})", generation);
            }
            ConnectionEvent::Frame(value) => match Envelope::from_wire(value) {
                Ok(envelope) => {
                    let unclaimed = match envelope.kind {
                        EnvelopeKind::Response => pending.resolve(envelope),
                        EnvelopeKind::Event | EnvelopeKind::Request => Some(envelope),
                    };
                    if let Some(unclaimed) = unclaimed {
                        router.dispatch_envelope(&unclaimed);
                    }
                }
                Err(e) => log::warn!("[Rpc] Dropping frame: {}", e),
            },
            ConnectionEvent::Closed {
                generation, reason, ..
            } => {
                let rejected = pending.fail_generation(generation);
                if rejected > 0 {
                    log::warn!(
                        "[Rpc] Connection lost ({}), rejected {} pending request(s)",
                        reason,
                        rejected
                    );
                }
            }
            ConnectionEvent::ConnectFailed { .. } => {}
        }
    }
    log::debug!("[Rpc] Event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;

    fn unreachable_client() -> RpcClient {
        RpcClient::builder(
            ConnectOptions::new("ws://127.0.0.1:1/ws").with_reconnect(ReconnectPolicy::Never),
        )
        .build()
    }

    #[tokio::test]
    async fn test_call_before_start_is_not_connected() {
        let client = unreachable_client();
        let result = client.call("ping", Value::Null).await;
        assert_eq!(result, Err(Error::NotConnected));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_while_connecting_leaves_no_entry() {
        let client = unreachable_client();
        client.start();
        let result = client.call("ping", Value::Null).await;
        assert_eq!(result, Err(Error::NotConnected));
        assert_eq!(client.pending_count(), 0);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_state_is_closed_when_not_started() {
        let client = unreachable_client();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.wait_connected().await, Err(Error::NotConnected));
    }

    #[tokio::test]
    async fn test_notify_failure_reaches_hook() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = RpcClient::builder(ConnectOptions::new("ws://127.0.0.1:1/ws"))
            .notify_hook(Arc::new(move |command: &str, error: &Error| {
                let _ = tx.send((command.to_string(), error.clone()));
            }))
            .build();

        client.notify("task.stop", serde_json::json!({"id": "t1"}));
        let (command, error) = rx.recv().await.unwrap();
        assert_eq!(command, "task.stop");
        assert_eq!(error, Error::NotConnected);
    }

    #[test]
    fn test_call_options_builders() {
        let token = CancellationToken::new();
        let options = CallOptions::default()
            .with_timeout(Duration::from_millis(5))
            .with_cancel(token);
        assert_eq!(options.timeout, Some(Duration::from_millis(5)));
        assert!(options.cancel.is_some());
    }
}
