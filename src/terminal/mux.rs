//! Session Multiplexer: many interactive terminal streams, one socket each.
//!
//! # Lifecycle
//!
//! ```text
//! create(id)
//!   1. Provisioner::create(id)          (HTTP side channel)
//!   2. Connection::open(ws/terminal/id) (dedicated socket)
//!   3. wait for Open, bounded by open_timeout
//!   4. register + start the frame pump
//!
//! destroy(id)
//!   create(id) in flight → abandon it and wait until it has unwound
//!   close socket → stop pump → unregister → Provisioner::destroy(id)
//!
//! exit frame from the server
//!   on_exit listeners → close socket → unregister
//! ```
//!
//! A failure in steps 1-3 leaves nothing registered. A `create` abandoned by
//! `destroy` tears its own remote process down and returns
//! [`Error::Cancelled`]; either way the remote process is destroyed once.
//! Listeners are global and receive the session id first, so one
//! registration covers every session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::frames::{ClientFrame, ServerFrame};
use super::provision::{Provisioner, SessionOptions};
use crate::config::Config;
use crate::connection::{ConnectOptions, Connection, ConnectionEvent};
use crate::error::{Error, Result};
use crate::listeners::{invoke_isolated, ListenerSet, Subscription};

type OutputListener = dyn Fn(&str, &[u8]) + Send + Sync;
type ExitListener = dyn Fn(&str, Option<i32>) + Send + Sync;
type TitleListener = dyn Fn(&str, &str) + Send + Sync;
type ConnectionListener = dyn Fn(&str, bool) + Send + Sync;

struct SignalRoute {
    kind: String,
    handler: Box<dyn Fn(&str, &Value) + Send + Sync>,
}

/// Public view of one registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Caller-assigned id.
    pub id: String,
    /// Working directory requested at creation.
    pub cwd: Option<String>,
    /// Initial command requested at creation.
    pub command: Option<String>,
    /// When the session finished opening.
    pub created_at: DateTime<Utc>,
    /// Whether the stream is currently connected.
    pub open: bool,
}

struct SessionEntry {
    /// Distinguishes a re-created session from an earlier one with the same id.
    instance: u64,
    info: SessionInfo,
    connection: Connection,
    pump: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Listeners {
    output: ListenerSet<OutputListener>,
    exit: ListenerSet<ExitListener>,
    title: ListenerSet<TitleListener>,
    signal: ListenerSet<SignalRoute>,
    connection: ListenerSet<ConnectionListener>,
}

/// A `create` that has not registered its session yet.
struct PendingCreate {
    /// Cancelled by `destroy`.
    abandon: CancellationToken,
    /// Cancelled once the `create` call has returned.
    finished: CancellationToken,
}

struct MuxInner {
    config: Config,
    provisioner: Arc<dyn Provisioner>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    creating: Mutex<HashMap<String, PendingCreate>>,
    next_instance: AtomicU64,
    listeners: Listeners,
}

impl MuxInner {
    /// Unregister `id` if it is still `instance`, closing its socket first.
    fn retire(&self, id: &str, instance: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(entry) if entry.instance == instance => {
                entry.connection.close();
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    fn set_open(&self, id: &str, instance: u64, open: bool) {
        if let Some(entry) = self.sessions.lock().get_mut(id) {
            if entry.instance == instance {
                entry.info.open = open;
            }
        }
    }
}

/// Removes an id from the in-flight set however `create` ends, then wakes
/// any `destroy` waiting on it.
struct CreatingGuard<'a> {
    creating: &'a Mutex<HashMap<String, PendingCreate>>,
    id: &'a str,
    finished: CancellationToken,
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        self.creating.lock().remove(self.id);
        self.finished.cancel();
    }
}

/// Supervisor for terminal sessions. Clones share the registry.
#[derive(Clone)]
pub struct TerminalMux {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for TerminalMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalMux")
            .field("sessions", &self.inner.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl TerminalMux {
    /// Multiplexer whose sessions use the endpoints and policy in `config`.
    pub fn new(config: Config, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                config,
                provisioner,
                sessions: Mutex::new(HashMap::new()),
                creating: Mutex::new(HashMap::new()),
                next_instance: AtomicU64::new(0),
                listeners: Listeners::default(),
            }),
        }
    }

    /// Provision the remote process for `id` and open its stream.
    ///
    /// Returns once the stream is open. On any failure nothing is registered
    /// and the remote process is torn down again if it was started. A
    /// [`destroy`](Self::destroy) of the same id before registration makes
    /// this return [`Error::Cancelled`].
    pub async fn create(&self, id: &str, options: SessionOptions) -> Result<SessionInfo> {
        let abandon = CancellationToken::new();
        let finished = CancellationToken::new();
        {
            let mut creating = self.inner.creating.lock();
            if creating.contains_key(id) || self.inner.sessions.lock().contains_key(id) {
                return Err(Error::SessionExists(id.to_string()));
            }
            creating.insert(
                id.to_string(),
                PendingCreate {
                    abandon: abandon.clone(),
                    finished: finished.clone(),
                },
            );
        }
        let _guard = CreatingGuard {
            creating: &self.inner.creating,
            id,
            finished,
        };

        let provisioned = tokio::select! {
            biased;
            () = abandon.cancelled() => None,
            result = self.inner.provisioner.create(id, &options) => Some(result),
        };
        match provisioned {
            Some(result) => result?,
            None => {
                // The request may have reached the backend before it was dropped.
                log::info!("[TerminalMux] Session {} destroyed while provisioning", id);
                self.teardown_remote(id).await;
                return Err(Error::Cancelled);
            }
        }

        let (connection, events) = match self.open_stream(id, &abandon).await {
            Ok(opened) => opened,
            Err(e) => {
                self.teardown_remote(id).await;
                return Err(e);
            }
        };

        if let Err(e) = connection.send_frame(&ClientFrame::Resize {
            cols: options.cols,
            rows: options.rows,
        }) {
            log::debug!("[TerminalMux] Initial resize for {} not sent: {}", id, e);
        }

        let instance = self.inner.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        let info = SessionInfo {
            id: id.to_string(),
            cwd: options.cwd,
            command: options.command,
            created_at: Utc::now(),
            open: true,
        };

        let abandoned = {
            // The pump cannot touch the registry until this lock is released.
            let mut sessions = self.inner.sessions.lock();
            if abandon.is_cancelled() {
                connection.close();
                true
            } else {
                let pump = tokio::spawn(run_session_pump(
                    id.to_string(),
                    instance,
                    events,
                    Arc::downgrade(&self.inner),
                ));
                sessions.insert(
                    id.to_string(),
                    SessionEntry {
                        instance,
                        info: info.clone(),
                        connection,
                        pump: Some(pump),
                    },
                );
                false
            }
        };

        if abandoned {
            log::info!("[TerminalMux] Session {} destroyed while opening", id);
            self.teardown_remote(id).await;
            return Err(Error::Cancelled);
        }

        log::info!("[TerminalMux] Session {} open", id);
        Ok(info)
    }

    async fn open_stream(
        &self,
        id: &str,
        abandon: &CancellationToken,
    ) -> Result<(Connection, mpsc::Receiver<ConnectionEvent>)> {
        let config = &self.inner.config;
        let url = config
            .terminal_ws_url(id)
            .map_err(|e| Error::SessionOpenFailed {
                id: id.to_string(),
                reason: format!("{e:#}"),
            })?;

        let (connection, events) = Connection::open(
            ConnectOptions::new(url)
                .with_headers(config.auth_headers())
                .with_reconnect(config.reconnect.clone()),
        );

        let opened = tokio::select! {
            biased;
            () = abandon.cancelled() => None,
            opened = tokio::time::timeout(config.open_timeout(), connection.wait_open()) => Some(opened),
        };
        let reason = match opened {
            Some(Ok(Ok(()))) => return Ok((connection, events)),
            Some(Ok(Err(e))) => e.to_string(),
            Some(Err(_elapsed)) => format!("not open after {:?}", config.open_timeout()),
            None => {
                connection.close();
                log::info!("[TerminalMux] Session {} destroyed while opening", id);
                return Err(Error::Cancelled);
            }
        };

        connection.close();
        log::warn!("[TerminalMux] Session {} failed to open: {}", id, reason);
        Err(Error::SessionOpenFailed {
            id: id.to_string(),
            reason,
        })
    }

    /// Best-effort `Provisioner::destroy` for a create that did not finish.
    async fn teardown_remote(&self, id: &str) {
        if let Err(e) = self.inner.provisioner.destroy(id).await {
            log::warn!("[TerminalMux] Cleanup of {} failed: {}", id, e);
        }
    }

    /// Close the session's stream, unregister it and stop the remote process.
    ///
    /// Destroying an unknown or already-exited session succeeds. A `create`
    /// still in flight for `id` is abandoned, and this returns only after it
    /// has unwound, so the session never appears afterwards.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let in_flight = self.inner.creating.lock().get(id).map(|pending| {
            pending.abandon.cancel();
            pending.finished.clone()
        });
        if let Some(finished) = in_flight {
            log::debug!("[TerminalMux] Waiting for in-flight create of {}", id);
            finished.cancelled().await;
        }

        let pump = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(id) else {
                log::debug!("[TerminalMux] Destroy of unknown session {}", id);
                return Ok(());
            };
            entry.connection.close();
            let pump = entry.pump.take();
            sessions.remove(id);
            pump
        };

        if let Some(pump) = pump {
            pump.abort();
            // Wait so no listener runs for this session after we return.
            let _ = pump.await;
        }

        log::info!("[TerminalMux] Session {} destroyed", id);
        self.inner.provisioner.destroy(id).await
    }

    /// Send keystrokes. Bytes for one session arrive in submission order.
    pub fn write(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.send(id, &ClientFrame::input(bytes))
    }

    /// Change the session's terminal size.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.send(id, &ClientFrame::Resize { cols, rows })
    }

    fn send(&self, id: &str, frame: &ClientFrame) -> Result<()> {
        let connection = self
            .inner
            .sessions
            .lock()
            .get(id)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        connection.send_frame(frame)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.sessions.lock().contains_key(id)
    }

    /// Snapshot of one session.
    pub fn session(&self, id: &str) -> Option<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .get(id)
            .map(|entry| entry.info.clone())
    }

    /// Snapshot of every session, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Destroy every session, including ones still being created. Returns how
    /// many ids were destroyed.
    pub async fn shutdown(&self) -> usize {
        let mut ids: Vec<String> = self.inner.creating.lock().keys().cloned().collect();
        ids.extend(self.inner.sessions.lock().keys().cloned());
        ids.sort();
        ids.dedup();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.destroy(&id).await {
                log::warn!("[TerminalMux] Shutdown of {} reported: {}", id, e);
            }
        }
        count
    }

    /// Output from any session: `(session_id, bytes)`.
    pub fn on_output<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.inner.listeners.output.add(Arc::new(handler))
    }

    /// Remote process exit: `(session_id, exit_code)`.
    pub fn on_exit<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, Option<i32>) + Send + Sync + 'static,
    {
        self.inner.listeners.exit.add(Arc::new(handler))
    }

    /// Title changes: `(session_id, title)`.
    pub fn on_title_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.inner.listeners.title.add(Arc::new(handler))
    }

    /// Domain signals of type `kind`: `(session_id, frame)`.
    pub fn on_signal<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.inner.listeners.signal.add(Arc::new(SignalRoute {
            kind: kind.to_string(),
            handler: Box::new(handler),
        }))
    }

    /// Stream connectivity: `(session_id, connected)`. Fires on unexpected
    /// drops and reconnects, not on `destroy`.
    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.inner.listeners.connection.add(Arc::new(handler))
    }
}

/// Fan one session's frames out to the global listeners.
async fn run_session_pump(
    id: String,
    instance: u64,
    mut events: mpsc::Receiver<ConnectionEvent>,
    mux: Weak<MuxInner>,
) {
    while let Some(event) = events.recv().await {
        let Some(mux) = mux.upgrade() else { break };
        let listeners = &mux.listeners;

        match event {
            ConnectionEvent::Opened { generation } => {
                mux.set_open(&id, instance, true);
                // The first open is reported by create() itself.
                if generation > 1 {
                    for listener in listeners.connection.snapshot() {
                        invoke_isolated("TerminalMux", || listener(&id, true));
                    }
                }
            }
            ConnectionEvent::Frame(value) => match ServerFrame::from_value(value) {
                Ok(ServerFrame::Output(data)) => {
                    for listener in listeners.output.snapshot() {
                        invoke_isolated("TerminalMux", || listener(&id, &data[..]));
                    }
                }
                Ok(ServerFrame::TitleChange(title)) => {
                    for listener in listeners.title.snapshot() {
                        invoke_isolated("TerminalMux", || listener(&id, &title));
                    }
                }
                Ok(ServerFrame::Signal { kind, body }) => {
                    for route in listeners.signal.snapshot() {
                        if route.kind == kind {
                            invoke_isolated("TerminalMux", || (route.handler)(&id, &body));
                        }
                    }
                }
                Ok(ServerFrame::Exit { code }) => {
                    log::info!("[TerminalMux] Session {} exited ({:?})", id, code);
                    for listener in listeners.exit.snapshot() {
                        invoke_isolated("TerminalMux", || listener(&id, code));
                    }
                    mux.retire(&id, instance);
                    break;
                }
                Err(e) => log::warn!("[TerminalMux] Session {}: {}", id, e),
            },
            ConnectionEvent::Closed { retry_in, .. } => {
                mux.set_open(&id, instance, false);
                for listener in listeners.connection.snapshot() {
                    invoke_isolated("TerminalMux", || listener(&id, false));
                }
                if retry_in.is_none() {
                    log::warn!("[TerminalMux] Session {} stream gone for good", id);
                    mux.retire(&id, instance);
                    break;
                }
            }
            ConnectionEvent::ConnectFailed { retry_in: None, .. } => {
                mux.retire(&id, instance);
                break;
            }
            ConnectionEvent::ConnectFailed { .. } => {}
        }
    }
}
