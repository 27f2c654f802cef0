//! The per-connection engine: response demultiplexing, command
//! serialization, event fan-out, and orderly teardown

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::{Command, Exit, LingerDirective};
use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
    CONTENT_TYPE_DISCONNECT, CONTENT_TYPE_EVENT_JSON, CONTENT_TYPE_EVENT_PLAIN,
    CONTENT_TYPE_EVENT_XML, EVENT_LISTEN_ALL, HANDLER_WAIT, HEADER_APPLICATION_UUID,
    HEADER_JOB_UUID, HEADER_UNIQUE_ID,
};
use crate::error::{EslError, EslResult};
use crate::event::{Event, EventFormat};
use crate::response::RawResponse;
use crate::transport::{Protocol, TransportRx, TransportTx};

/// Callback invoked for each matching event. Fires on its own task, so it
/// may run concurrently across events; it never runs twice concurrently
/// for the same delivery.
pub type EventListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Options common to inbound and outbound connections.
#[derive(Debug, Clone)]
pub struct Options {
    /// Root cancellation context. Cancelling it terminates every
    /// connection derived from these options.
    pub cancel: CancellationToken,
    /// Wire protocol to dial with or serve.
    pub protocol: Protocol,
    /// Bound on the graceful `exit` exchange during close.
    pub exit_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            protocol: Protocol::default(),
            exit_timeout: crate::constants::DEFAULT_EXIT_TIMEOUT,
        }
    }
}

/// When to close the socket after a disconnect notice arrives on an
/// outbound connection. Mutated by the `linger` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseDelay {
    Immediate,
    After(Duration),
    Never,
}

/// Write path state. Holding this mutex across the write *and* the reply
/// wait is what guarantees at most one outstanding command: ESL carries no
/// correlation ids, so replies can only be matched by order.
struct CommandGate {
    tx: TransportTx,
    reply_rx: mpsc::Receiver<RawResponse>,
    api_rx: mpsc::Receiver<RawResponse>,
}

/// Receivers handed to the role-specific watchers at construction.
pub(crate) struct RoleChannels {
    pub(crate) auth_rx: mpsc::Receiver<RawResponse>,
    pub(crate) disconnect_rx: mpsc::Receiver<RawResponse>,
}

struct ConnectionInner {
    gate: Mutex<CommandGate>,
    /// Content-type tag → sink. Cleared (senders dropped) by teardown so
    /// every pending receive wakes with `None`.
    sinks: RwLock<HashMap<&'static str, mpsc::Sender<RawResponse>>>,
    /// Listener key (UUID or the wildcard) → listener id → callback.
    listeners: SyncRwLock<HashMap<String, HashMap<String, EventListener>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    close_delay: SyncMutex<CloseDelay>,
    exit_timeout: Duration,
    outbound: bool,
    remote_addr: String,
}

/// One ESL session, inbound or outbound. Cheap to clone; all clones share
/// the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.inner.remote_addr)
            .field("outbound", &self.inner.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wire a transport into a running engine: builds the response sinks,
    /// then starts the receive and event loops.
    pub(crate) fn new(
        rx: TransportRx,
        tx: TransportTx,
        outbound: bool,
        cancel: CancellationToken,
        exit_timeout: Duration,
        remote_addr: String,
    ) -> (Self, RoleChannels) {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (api_tx, api_rx) = mpsc::channel(1);
        let (plain_tx, plain_rx) = mpsc::channel(1);
        let (xml_tx, xml_rx) = mpsc::channel(1);
        let (json_tx, json_rx) = mpsc::channel(1);
        // Buffered so the initial challenge survives until the dialer is
        // ready to consume it; losing it would deadlock inbound setup.
        let (auth_tx, auth_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);

        let mut sinks: HashMap<&'static str, mpsc::Sender<RawResponse>> = HashMap::new();
        sinks.insert(CONTENT_TYPE_COMMAND_REPLY, reply_tx);
        sinks.insert(CONTENT_TYPE_API_RESPONSE, api_tx);
        sinks.insert(CONTENT_TYPE_EVENT_PLAIN, plain_tx);
        sinks.insert(CONTENT_TYPE_EVENT_XML, xml_tx);
        sinks.insert(CONTENT_TYPE_EVENT_JSON, json_tx);
        sinks.insert(CONTENT_TYPE_AUTH_REQUEST, auth_tx);
        sinks.insert(CONTENT_TYPE_DISCONNECT, disconnect_tx);

        let inner = Arc::new(ConnectionInner {
            gate: Mutex::new(CommandGate {
                tx,
                reply_rx,
                api_rx,
            }),
            sinks: RwLock::new(sinks),
            listeners: SyncRwLock::new(HashMap::new()),
            cancel,
            closed: AtomicBool::new(false),
            close_delay: SyncMutex::new(CloseDelay::Immediate),
            exit_timeout,
            outbound,
            remote_addr,
        });

        tokio::spawn(receive_loop(inner.clone(), rx));
        tokio::spawn(event_loop(inner.clone(), plain_rx, xml_rx, json_rx));

        (
            Self { inner },
            RoleChannels {
                auth_rx,
                disconnect_rx,
            },
        )
    }

    /// Send one command and wait for its reply.
    ///
    /// Concurrent callers queue strictly; the write lock is held through
    /// the reply wait. Either `command/reply` or `api/response` satisfies
    /// the wait; which one arrives depends on the command kind, and the
    /// protocol guarantees reply order matches send order.
    ///
    /// Bound the call with [`tokio::time::timeout`] to apply a deadline; on
    /// expiry the connection stays usable, but a reply still in flight will
    /// be consumed by the next caller, so keep timed-out pipelines serial.
    pub async fn send_command(&self, cmd: &dyn Command) -> EslResult<RawResponse> {
        let mut gate = self
            .inner
            .gate
            .lock()
            .await;

        // Linger is a command and a state mutator: adjust the close delay
        // while we still hold the write path.
        if let Some(directive) = cmd.linger_directive() {
            let delay = match directive {
                LingerDirective::Disable => CloseDelay::Immediate,
                LingerDirective::Delay(duration) => CloseDelay::After(duration),
                LingerDirective::Forever => CloseDelay::Never,
            };
            *self
                .inner
                .close_delay
                .lock() = delay;
        }

        let message = cmd.build_message();
        debug!("sending command: {}", cmd.describe());
        gate.tx
            .write(&message)
            .await?;

        let CommandGate {
            reply_rx, api_rx, ..
        } = &mut *gate;
        tokio::select! {
            reply = reply_rx.recv() => reply.ok_or(EslError::ConnectionClosed),
            reply = api_rx.recv() => reply.ok_or(EslError::ConnectionClosed),
        }
    }

    /// Run an `api` command and wait for the response.
    pub async fn api(&self, command: impl Into<String>) -> EslResult<RawResponse> {
        self.send_command(&crate::command::Api {
            command: command.into(),
            ..Default::default()
        })
        .await
    }

    /// Run a `bgapi` command; the reply carries the `Job-UUID`, the result
    /// arrives later as a BACKGROUND_JOB event.
    pub async fn bgapi(&self, command: impl Into<String>) -> EslResult<RawResponse> {
        self.send_command(&crate::command::Api {
            command: command.into(),
            background: true,
            ..Default::default()
        })
        .await
    }

    /// Register a listener under a channel UUID, application UUID, job
    /// UUID, or [`EVENT_LISTEN_ALL`]. Returns the id used to remove it.
    ///
    /// A listener registered under the wildcard and under a UUID receives
    /// matching events once per key.
    pub fn register_event_listener(
        &self,
        key: impl Into<String>,
        listener: impl Fn(Event) + Send + Sync + 'static,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut listeners = self
            .inner
            .listeners
            .write();
        listeners
            .entry(key.into())
            .or_default()
            .insert(id.clone(), Arc::new(listener));
        id
    }

    /// Remove a listener by key and registration id. Unknown ids are a
    /// silent no-op.
    pub fn remove_event_listener(&self, key: &str, id: &str) {
        let mut listeners = self
            .inner
            .listeners
            .write();
        if let Some(registered) = listeners.get_mut(key) {
            registered.remove(id);
        }
    }

    /// Gracefully send `exit` (bounded by the exit timeout), then tear the
    /// connection down. Only the first close has effect.
    pub async fn exit_and_close(&self) {
        self.shutdown(true)
            .await;
    }

    /// Tear the connection down without sending `exit`. Only the first
    /// close has effect.
    pub async fn close(&self) {
        self.shutdown(false)
            .await;
    }

    async fn shutdown(&self, graceful: bool) {
        if self
            .inner
            .closed
            .swap(true, Ordering::SeqCst)
        {
            return;
        }

        if graceful {
            let _ = timeout(self.inner.exit_timeout, self.send_command(&Exit)).await;
        }

        // Order matters: cancel wakes every loop, dropping the sinks wakes
        // every pending reply wait, and only then does the transport go
        // away. Nothing can send into a sink that no longer exists.
        self.inner
            .cancel
            .cancel();
        self.inner
            .sinks
            .write()
            .await
            .clear();

        let mut gate = self
            .inner
            .gate
            .lock()
            .await;
        if let Err(err) = gate
            .tx
            .close()
            .await
        {
            debug!("error closing transport to {}: {}", self.inner.remote_addr, err);
        }
    }

    /// Whether teardown has run.
    pub fn is_closed(&self) -> bool {
        self.inner
            .closed
            .load(Ordering::SeqCst)
    }

    /// Resolves when the connection's run context is cancelled. Outbound
    /// handlers select on this to stop long-running work.
    pub async fn done(&self) {
        self.inner
            .cancel
            .cancelled()
            .await
    }

    /// Remote peer address, for logging.
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Role of this connection.
    pub fn is_outbound(&self) -> bool {
        self.inner.outbound
    }

    pub(crate) fn close_delay(&self) -> CloseDelay {
        *self
            .inner
            .close_delay
            .lock()
    }
}

/// Deliver one record to the sink named by its Content-Type.
///
/// Three-way race: the sink accepts, the per-message grace period expires
/// (record dropped with a warning), or the connection is cancelled.
async fn dispatch(inner: &ConnectionInner, response: RawResponse) -> EslResult<()> {
    let content_type = response
        .content_type()
        .to_string();
    let sink = {
        let sinks = inner
            .sinks
            .read()
            .await;
        if sinks.is_empty() {
            // Teardown already ran.
            return Err(EslError::ConnectionClosed);
        }
        sinks
            .get(content_type.as_str())
            .cloned()
    };
    let Some(sink) = sink else {
        return Err(EslError::UnknownContentType { content_type });
    };

    tokio::select! {
        result = sink.send_timeout(response, HANDLER_WAIT) => match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(dropped)) => {
                warn!(
                    "no one to handle response, is the connection overloaded or stopping? Content-Type: {}",
                    dropped.content_type()
                );
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(EslError::ConnectionClosed),
        },
        _ = inner.cancel.cancelled() => Err(EslError::ConnectionClosed),
    }
}

/// Reads records off the transport until error, unknown content-type, or
/// cancellation. Termination does not itself tear the connection down; the
/// writer or a user-level close converges on that.
async fn receive_loop(inner: Arc<ConnectionInner>, mut rx: TransportRx) {
    loop {
        let response = tokio::select! {
            result = rx.read_response() => match result {
                Ok(response) => response,
                Err(EslError::ConnectionClosed) => {
                    debug!("transport to {} closed", inner.remote_addr);
                    return;
                }
                Err(err) => {
                    warn!("error receiving message from {}: {}", inner.remote_addr, err);
                    return;
                }
            },
            _ = inner.cancel.cancelled() => return,
        };

        if let Err(err) = dispatch(&inner, response).await {
            if !matches!(err, EslError::ConnectionClosed) {
                warn!("error receiving message from {}: {}", inner.remote_addr, err);
            }
            return;
        }
    }
}

/// Drains the three event sinks, decodes per format, and fans out to the
/// listeners. Parse failures are logged and skipped.
async fn event_loop(
    inner: Arc<ConnectionInner>,
    mut plain_rx: mpsc::Receiver<RawResponse>,
    mut xml_rx: mpsc::Receiver<RawResponse>,
    mut json_rx: mpsc::Receiver<RawResponse>,
) {
    loop {
        let (raw, format) = tokio::select! {
            raw = plain_rx.recv() => match raw {
                Some(raw) => (raw, EventFormat::Plain),
                None => return,
            },
            raw = xml_rx.recv() => match raw {
                Some(raw) => (raw, EventFormat::Xml),
                None => return,
            },
            raw = json_rx.recv() => match raw {
                Some(raw) => (raw, EventFormat::Json),
                None => return,
            },
            _ = inner.cancel.cancelled() => return,
        };

        let event = match Event::parse(raw, format) {
            Ok(event) => event,
            Err(err) => {
                warn!("parsing event error: {}", err);
                continue;
            }
        };

        call_event_listeners(&inner, event);
    }
}

/// Walk the four key dimensions (wildcard, channel UUID, application
/// UUID, job UUID) and fire every registered listener on its own task.
fn call_event_listeners(inner: &ConnectionInner, event: Event) {
    let listeners = inner
        .listeners
        .read();

    if let Some(registered) = listeners.get(EVENT_LISTEN_ALL) {
        for listener in registered.values() {
            spawn_listener(listener.clone(), event.clone());
        }
    }

    for key_header in [HEADER_UNIQUE_ID, HEADER_APPLICATION_UUID, HEADER_JOB_UUID] {
        if let Some(value) = event.header(key_header) {
            if let Some(registered) = listeners.get(value) {
                for listener in registered.values() {
                    spawn_listener(listener.clone(), event.clone());
                }
            }
        }
    }
}

fn spawn_listener(listener: EventListener, event: Event) {
    tokio::spawn(async move {
        listener(event);
    });
}
