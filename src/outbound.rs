//! Outbound mode: accept connections FreeSWITCH dials on behalf of a call
//! and drive a user handler per session

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::{accept_hdr_async, MaybeTlsStream};
use tracing::{debug, info, warn};

use crate::command::Connect;
use crate::connection::{CloseDelay, Connection, Options, RoleChannels};
use crate::constants::{DEFAULT_CONNECTION_DELAY, DEFAULT_CONNECT_TIMEOUT, HEADER_REQUEST_ID};
use crate::error::{EslError, EslResult};
use crate::response::RawResponse;
use crate::transport::{bind_tcp, split_tcp, split_ws, Network, Protocol, TransportRx, TransportTx};

/// Per-session callback: receives the connection and the `connect` reply
/// (the channel data). The session closes after the handler returns.
pub type OutboundHandler =
    Arc<dyn Fn(Connection, RawResponse) -> BoxFuture<'static, ()> + Send + Sync>;

/// Options for serving outbound ESL connections.
#[derive(Clone)]
pub struct OutboundOptions {
    /// Options common to both modes.
    pub options: Options,
    /// Address family restriction for the listener.
    pub network: Network,
    /// Bound on the initial `connect` exchange.
    pub connect_timeout: Duration,
    /// Pause between handler completion and the closing `exit`.
    pub connection_delay: Duration,
}

impl Default for OutboundOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundOptions {
    /// Defaults: TCP, 5 s connect timeout, 25 ms connection delay.
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            network: Network::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }

    /// Listen on `address` with the configured protocol and hand each
    /// accepted session to `handler`. Runs until an accept error or until
    /// the root context is cancelled.
    pub async fn listen_and_serve<H, Fut>(&self, address: &str, handler: H) -> EslResult<()>
    where
        H: Fn(Connection, RawResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: OutboundHandler =
            Arc::new(move |conn, response| Box::pin(handler(conn, response)));
        match self.options.protocol {
            Protocol::Tcpsocket => {
                self.listen_and_serve_tcp(address, handler)
                    .await
            }
            Protocol::Websocket => {
                self.listen_and_serve_ws(address, handler)
                    .await
            }
        }
    }

    /// Serve on an already-bound listener with the configured protocol.
    /// Useful when the caller needs the bound address (port 0 listeners).
    pub async fn serve<H, Fut>(&self, listener: TcpListener, handler: H) -> EslResult<()>
    where
        H: Fn(Connection, RawResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: OutboundHandler =
            Arc::new(move |conn, response| Box::pin(handler(conn, response)));
        match self.options.protocol {
            Protocol::Tcpsocket => {
                self.serve_tcp(listener, handler)
                    .await
            }
            Protocol::Websocket => {
                self.serve_ws(listener, handler)
                    .await
            }
        }
    }

    async fn listen_and_serve_tcp(&self, address: &str, handler: OutboundHandler) -> EslResult<()> {
        let listener = bind_tcp(self.network, address).await?;
        info!(
            "listening for new ESL connections on {}",
            listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| address.to_string())
        );
        self.serve_tcp(listener, handler)
            .await
    }

    /// Accept loop over an already-bound listener.
    async fn serve_tcp(&self, listener: TcpListener, handler: OutboundHandler) -> EslResult<()> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.options.cancel.cancelled() => {
                    info!("outbound server shutting down");
                    return Ok(());
                }
            };
            let (rx, tx) = split_tcp(stream);
            self.start_connection(rx, tx, peer_addr.to_string(), handler.clone(), None);
        }
    }

    async fn listen_and_serve_ws(&self, address: &str, handler: OutboundHandler) -> EslResult<()> {
        let listener = bind_tcp(self.network, address).await?;
        info!(
            "listening for new ESL websocket connections on {}",
            listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| address.to_string())
        );
        self.serve_ws(listener, handler)
            .await
    }

    /// Accept loop that upgrades each connection to WebSocket, capturing
    /// the request path for the `/ws/<rid>` request id.
    async fn serve_ws(&self, listener: TcpListener, handler: OutboundHandler) -> EslResult<()> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.options.cancel.cancelled() => {
                    info!("outbound server shutting down");
                    return Ok(());
                }
            };
            let opts = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut path = String::new();
                let stream = match accept_hdr_async(
                    MaybeTlsStream::Plain(stream),
                    |request: &UpgradeRequest, response: UpgradeResponse| {
                        path = request
                            .uri()
                            .path()
                            .to_string();
                        Ok(response)
                    },
                )
                .await
                {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("upgrade ws connection error: {}", err);
                        return;
                    }
                };

                let request_id = path
                    .strip_prefix("/ws")
                    .unwrap_or(path.as_str())
                    .trim_matches('/')
                    .to_string();
                let (rx, tx) = split_ws(stream);
                opts.start_connection(
                    rx,
                    tx,
                    peer_addr.to_string(),
                    handler,
                    (!request_id.is_empty()).then_some(request_id),
                );
            });
        }
    }

    fn start_connection(
        &self,
        rx: TransportRx,
        tx: TransportTx,
        remote_addr: String,
        handler: OutboundHandler,
        request_id: Option<String>,
    ) {
        let (conn, roles) = Connection::new(
            rx,
            tx,
            true,
            self.options
                .cancel
                .child_token(),
            self.options.exit_timeout,
            remote_addr,
        );
        match &request_id {
            Some(id) => info!(
                "new outbound connection from {}, request id: {}",
                conn.remote_addr(),
                id
            ),
            None => info!("new outbound connection from {}", conn.remote_addr()),
        }
        tokio::spawn(outbound_waiter(conn.clone(), roles));
        // The handler is not called directly so the session always closes
        // cleanly after it returns.
        tokio::spawn(outbound_handle(
            conn,
            handler,
            self.connection_delay,
            self.connect_timeout,
            request_id,
        ));
    }
}

/// Serve with default options: TCP, 5 s connect timeout, 25 ms delay.
pub async fn listen_and_serve<H, Fut>(address: &str, handler: H) -> EslResult<()>
where
    H: Fn(Connection, RawResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    OutboundOptions::new()
        .listen_and_serve(address, handler)
        .await
}

/// Issue `connect`, hand the reply to the user handler, and close the
/// session once the handler finishes.
async fn outbound_handle(
    conn: Connection,
    handler: OutboundHandler,
    connection_delay: Duration,
    connect_timeout: Duration,
    request_id: Option<String>,
) {
    let mut response = match timeout(connect_timeout, conn.send_command(&Connect)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!("error connecting to {}: {}", conn.remote_addr(), err);
            // Communication failed; close without the exit exchange.
            conn.close()
                .await;
            return;
        }
        Err(_) => {
            warn!(
                "error connecting to {}: {}",
                conn.remote_addr(),
                EslError::timeout(connect_timeout)
            );
            conn.close()
                .await;
            return;
        }
    };

    if let Some(request_id) = request_id {
        response.insert_header(HEADER_REQUEST_ID, request_id);
    }

    handler(conn.clone(), response).await;

    // Short-lived sessions can close before FreeSWITCH has finished
    // starting the socket application on its side, losing the handler's
    // last command. Give it a moment before exiting.
    sleep(connection_delay).await;
    conn.exit_and_close()
        .await;
}

/// Waits out the session: schedules the close when the disconnect notice
/// arrives (honoring the linger delay), and swallows the spurious auth
/// prompts outbound sockets sometimes receive.
async fn outbound_waiter(conn: Connection, roles: RoleChannels) {
    let RoleChannels {
        mut auth_rx,
        mut disconnect_rx,
    } = roles;
    let mut auth_open = true;

    loop {
        tokio::select! {
            notice = disconnect_rx.recv() => {
                if notice.is_none() {
                    return;
                }
                info!("disconnect outbound connection {}", conn.remote_addr());
                match conn.close_delay() {
                    CloseDelay::Never => {}
                    CloseDelay::Immediate => {
                        conn.close().await;
                    }
                    CloseDelay::After(delay) => {
                        let conn = conn.clone();
                        tokio::spawn(async move {
                            sleep(delay).await;
                            conn.close().await;
                        });
                    }
                }
                return;
            }
            challenge = auth_rx.recv(), if auth_open => {
                match challenge {
                    Some(_) => {
                        debug!("ignoring auth request on outbound connection {}", conn.remote_addr());
                    }
                    None => auth_open = false,
                }
            }
            _ = conn.done() => return,
        }
    }
}
