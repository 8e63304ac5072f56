//! WebSocket relay server and HTTP listener.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── outbound queue A ──► Client A
//! Client B ──┼── conn tasks ──► RelayHub ── outbound queue B ──► Client B
//! Client C ──┘   (read/write)       └── outbound queue C ──► Client C
//!                                     ▲
//!                      HTTP API ──────┘ (online count, stats)
//! ```
//!
//! Each accepted socket gets its own task that decodes inbound frames into
//! hub commands and writes whatever the hub queues for it. On shutdown the
//! accept loop stops first, then the hub drains its queue and closes every
//! connection, then the HTTP listener winds down.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::http;
use crate::hub::RelayHub;
use crate::protocol::{ClientEvent, ProtocolError, SessionId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A socket that has not finished the upgrade by then is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a connection waits for the peer's close reply after sending
/// its own close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// The relay server, before binding.
#[derive(Debug, Clone)]
pub struct RelayServer {
    config: RelayConfig,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: RelayConfig::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind both listeners and start the hub.
    pub async fn bind(self) -> Result<BoundRelay, RelayError> {
        let ws_listener = bind(&self.config.ws_bind_addr).await?;
        let http_listener = bind(&self.config.http_bind_addr).await?;
        let hub = RelayHub::spawn(&self.config);
        Ok(BoundRelay {
            config: self.config,
            ws_listener,
            http_listener,
            hub,
            started: Instant::now(),
        })
    }

}

async fn bind(addr: &str) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// A relay with its listeners bound, ready to serve.
pub struct BoundRelay {
    config: RelayConfig,
    ws_listener: TcpListener,
    http_listener: TcpListener,
    hub: RelayHub,
    started: Instant,
}

impl BoundRelay {
    pub fn ws_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.ws_listener.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    pub async fn serve(self) -> Result<(), RelayError> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then stop accepting, let the hub
    /// finish what is already queued, and close every connection. Returns
    /// once every connection task has written its queue and its close frame.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let BoundRelay {
            config,
            ws_listener,
            http_listener,
            hub,
            started,
        } = self;

        log::info!("Relay listening on ws://{}", ws_listener.local_addr()?);
        log::info!("HTTP API listening on http://{}", http_listener.local_addr()?);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let app = http::router(hub.clone(), started);
        let http_server = tokio::spawn(async move {
            axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.wait_for(|stopped| *stopped).await;
                })
                .await
        });

        let mut connections = JoinSet::new();
        tokio::select! {
            _ = accept_loop(&ws_listener, &hub, config.outbound_capacity, &mut connections) => {}
            _ = shutdown => {
                log::info!("Shutdown requested, no longer accepting connections");
            }
        }
        drop(ws_listener);

        match hub.shutdown().await {
            Ok(closed) => log::info!("Closed {closed} relay connections"),
            Err(e) => log::warn!("Relay hub already stopped: {e}"),
        }

        log::info!("Flushing {} connections", connections.len());
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                log::error!("Connection task failed: {e}");
            }
        }

        let _ = stop_tx.send(true);
        match http_server.await {
            Ok(result) => result?,
            Err(e) => log::error!("HTTP server task failed: {e}"),
        }
        log::info!("Relay stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: &TcpListener,
    hub: &RelayHub,
    capacity: usize,
    connections: &mut JoinSet<()>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    log::error!("Connection task failed: {e}");
                }
                continue;
            }
        };
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        log::debug!("New TCP connection from {addr}");

        let hub = hub.clone();
        connections.spawn(async move {
            if let Err(e) = handle_connection(stream, addr, hub, capacity).await {
                log::warn!("Connection error from {addr}: {e}");
            }
        });
    }
}

/// Handle a single WebSocket connection from handshake to disconnect.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: RelayHub,
    capacity: usize,
) -> Result<(), RelayError> {
    let ws_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let session = SessionId::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(capacity);
    hub.connect(session, Some(addr), outbound_tx)?;

    let result = pump(session, &hub, &mut ws_sender, &mut ws_receiver, &mut outbound_rx).await;

    // Unconditional: the registry must not keep an entry for a dead socket.
    let _ = hub.disconnect(session);
    let _ = ws_sender.close().await;
    result
}

async fn pump(
    session: SessionId,
    hub: &RelayHub,
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    outbound_rx: &mut mpsc::Receiver<Message>,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientEvent::decode(text.as_str()) {
                            Ok(event) => {
                                let kind = event.kind;
                                log::debug!("{session} sent {kind}");
                                // A stopped hub still leaves our queue to flush.
                                if hub.dispatch(session, event).is_err() {
                                    log::debug!("Hub stopped, dropping {kind} from {session}");
                                }
                            }
                            Err(e) => {
                                log::warn!("Ignoring frame from {session}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection closed by {session}");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary frame from {session}", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {session}: {e}");
                        break;
                    }
                }
            }

            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let closing = matches!(frame, Message::Close(_));
                        ws_sender.send(frame).await?;
                        if closing {
                            await_close_reply(session, ws_receiver).await;
                            break;
                        }
                    }
                    // The hub dropped the route without a close frame.
                    None => break,
                }
            }
        }
    }
    Ok(())
}

/// Read until the peer answers our close frame or goes away.
async fn await_close_reply(session: SessionId, ws_receiver: &mut WsSource) {
    let drained = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        log::debug!("No close reply from {session}");
    }
}
