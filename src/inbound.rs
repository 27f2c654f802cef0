//! Inbound mode: dial FreeSWITCH, authenticate, watch for re-challenges
//! and disconnects

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use crate::command::Auth;
use crate::connection::{Connection, Options};
use crate::constants::{DEFAULT_AUTH_TIMEOUT, DEFAULT_PASSWORD};
use crate::error::{EslError, EslResult};
use crate::response::RawResponse;
use crate::transport::{dial_tcp, split_tcp, split_ws, Network, Protocol, TransportRx, TransportTx};

/// Callback fired when an inbound connection is disconnected, whether by
/// us, by FreeSWITCH, or by a network error.
pub type OnDisconnect = Arc<dyn Fn() + Send + Sync>;

/// Options for dialing an inbound ESL connection.
#[derive(Clone)]
pub struct InboundOptions {
    /// Options common to both modes.
    pub options: Options,
    /// Address family restriction for the dial.
    pub network: Network,
    /// ESL password, usually `ClueCon`.
    pub password: String,
    /// Bound on each auth exchange, including the wait for the challenge.
    pub auth_timeout: Duration,
    /// Fired when the connection goes away.
    pub on_disconnect: Option<OnDisconnect>,
}

impl Default for InboundOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundOptions {
    /// Defaults: TCP, password `ClueCon`, 5 s auth timeout.
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            network: Network::default(),
            password: DEFAULT_PASSWORD.to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            on_disconnect: None,
        }
    }

    /// Dial the configured protocol: a `host:port` address for TCP, a
    /// `ws://…` URL for WebSocket.
    pub async fn dial(&self, address_or_url: &str) -> EslResult<Connection> {
        match self.options.protocol {
            Protocol::Tcpsocket => {
                self.dial_tcpsocket(address_or_url)
                    .await
            }
            Protocol::Websocket => {
                self.dial_websocket(address_or_url)
                    .await
            }
        }
    }

    /// Dial a raw TCP connection to `host:port`.
    pub async fn dial_tcpsocket(&self, address: &str) -> EslResult<Connection> {
        let stream = dial_tcp(self.network, address).await?;
        let remote_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| address.to_string());
        let (rx, tx) = split_tcp(stream);
        self.handle_connection(rx, tx, remote_addr)
            .await
    }

    /// Dial a WebSocket connection to a `ws://host:port/path` URL.
    pub async fn dial_websocket(&self, url: &str) -> EslResult<Connection> {
        let (stream, _response) = connect_async(url).await?;
        let (rx, tx) = split_ws(stream);
        self.handle_connection(rx, tx, url.to_string())
            .await
    }

    async fn handle_connection(
        &self,
        rx: TransportRx,
        tx: TransportTx,
        remote_addr: String,
    ) -> EslResult<Connection> {
        let (conn, mut roles) = Connection::new(
            rx,
            tx,
            false,
            self.options
                .cancel
                .child_token(),
            self.options.exit_timeout,
            remote_addr,
        );

        // The auth sink is buffered, so the challenge is waiting even when
        // FreeSWITCH wins the race to the socket.
        let challenge = match timeout(self.auth_timeout, roles.auth_rx.recv()).await {
            Ok(Some(challenge)) => Some(challenge),
            Ok(None) => None,
            Err(_) => {
                let err = EslError::timeout(self.auth_timeout);
                self.fail_auth(&conn)
                    .await;
                return Err(err);
            }
        };
        if challenge.is_none() {
            self.fail_auth(&conn)
                .await;
            return Err(EslError::ConnectionClosed);
        }

        if let Err(err) = do_auth(&conn, &self.password, self.auth_timeout).await {
            self.fail_auth(&conn)
                .await;
            return Err(err);
        }
        info!("successfully authenticated {}", conn.remote_addr());

        // Inbound-only watchers.
        tokio::spawn(auth_loop(
            conn.clone(),
            roles.auth_rx,
            self.password.clone(),
            self.auth_timeout,
        ));
        tokio::spawn(disconnect_loop(
            conn.clone(),
            roles.disconnect_rx,
            self.on_disconnect
                .clone(),
        ));

        Ok(conn)
    }

    /// Auth failed or never completed: disconnect gracefully and tell the
    /// caller's disconnect hook.
    async fn fail_auth(&self, conn: &Connection) {
        conn.exit_and_close()
            .await;
        if let Some(on_disconnect) = self
            .on_disconnect
            .clone()
        {
            tokio::spawn(async move { on_disconnect() });
        }
    }
}

/// Dial with default options: TCP, 5 s timeouts. `on_disconnect` fires when
/// the connection is closed by us, FreeSWITCH, or a network error.
pub async fn dial(
    address: &str,
    password: &str,
    on_disconnect: impl Fn() + Send + Sync + 'static,
) -> EslResult<Connection> {
    let opts = InboundOptions {
        password: password.to_string(),
        on_disconnect: Some(Arc::new(on_disconnect)),
        ..InboundOptions::new()
    };
    opts.dial(address)
        .await
}

/// One auth exchange, bounded by the auth timeout.
async fn do_auth(conn: &Connection, password: &str, auth_timeout: Duration) -> EslResult<()> {
    let auth = Auth {
        password: password.to_string(),
    };
    let response = timeout(auth_timeout, conn.send_command(&auth))
        .await
        .map_err(|_| EslError::timeout(auth_timeout))??;
    if !response.is_ok() {
        return Err(EslError::AuthFailed { response });
    }
    Ok(())
}

/// FreeSWITCH occasionally re-challenges a live connection; answer each
/// challenge, and close the connection when one fails.
async fn auth_loop(
    conn: Connection,
    mut auth_rx: mpsc::Receiver<RawResponse>,
    password: String,
    auth_timeout: Duration,
) {
    loop {
        tokio::select! {
            challenge = auth_rx.recv() => {
                if challenge.is_none() {
                    return;
                }
                match do_auth(&conn, &password, auth_timeout).await {
                    Ok(()) => info!("successfully authenticated {}", conn.remote_addr()),
                    Err(err) => {
                        warn!("failed to auth: {}", err);
                        conn.exit_and_close().await;
                        return;
                    }
                }
            }
            _ = conn.done() => return,
        }
    }
}

/// Close on the remote's disconnect notice, then fire the user hook.
async fn disconnect_loop(
    conn: Connection,
    mut disconnect_rx: mpsc::Receiver<RawResponse>,
    on_disconnect: Option<OnDisconnect>,
) {
    tokio::select! {
        notice = disconnect_rx.recv() => {
            if notice.is_some() {
                info!("disconnect notice from {}", conn.remote_addr());
                conn.close().await;
                if let Some(on_disconnect) = on_disconnect {
                    on_disconnect();
                }
            }
        }
        _ = conn.done() => {}
    }
}
