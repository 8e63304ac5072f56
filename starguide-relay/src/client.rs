//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, greeting handshake, close)
//! - Typed senders for every client event
//! - A receiver of decoded server events
//!
//! Used by the integration tests; also handy for bots and load scripts.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, EventKind, ProtocolError, ServerEvent, SessionId};

/// How long `connect` waits for the server greeting.
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A connected relay client.
pub struct RelayClient {
    /// Session id the server assigned us
    session_id: SessionId,

    /// Greeting text from the server
    greeting: String,

    /// Connection state, flipped by the reader task on close
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Message>,

    /// Decoded server events for the application
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
}

impl RelayClient {
    /// Connect and wait for the `connected` greeting.
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (session_id, greeting) = tokio::time::timeout(GREETING_TIMEOUT, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(ServerEvent::Connected {
                            message,
                            session_id,
                        }) = ServerEvent::decode(text.as_str())
                        {
                            return Ok((session_id, message));
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            Err(ProtocolError::ConnectionClosed)
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server events
        let (event_tx, event_rx) = mpsc::channel(256);
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    // Keep reading so the close reply goes out; the stream
                    // ends once the handshake completes.
                    Ok(Message::Close(_)) => {}
                    Err(_) => break,
                    Ok(_) => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        Ok(Self {
            session_id,
            greeting,
            state,
            outgoing_tx: out_tx,
            event_rx: Some(event_rx),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub async fn send_event(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        self.send_raw(event.encode()?).await
    }

    /// Send an arbitrary text frame, bypassing encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Announce who we are; registers us as online.
    pub async fn join(&self, descriptor: Value) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::new(EventKind::UserJoined, descriptor))
            .await
    }

    pub async fn send_chat(&self, payload: Value) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::new(EventKind::ChatMessage, payload))
            .await
    }

    /// Invite `target`. Object fields in `extra` ride along with the target id.
    pub async fn send_battle_invite(
        &self,
        target: impl std::fmt::Display,
        extra: Value,
    ) -> Result<(), ProtocolError> {
        let mut payload = json!({ "targetUserId": target.to_string() });
        if let (Value::Object(fields), Some(obj)) = (extra, payload.as_object_mut()) {
            for (key, value) in fields {
                obj.entry(key).or_insert(value);
            }
        }
        self.send_event(&ClientEvent::new(EventKind::BattleInvite, payload))
            .await
    }

    pub async fn join_pod(&self, pod_id: impl Into<Value>) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::new(
            EventKind::JoinPod,
            json!({ "podId": pod_id.into() }),
        ))
        .await
    }

    pub async fn leave_pod(&self, pod_id: impl Into<Value>) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::new(
            EventKind::LeavePod,
            json!({ "podId": pod_id.into() }),
        ))
        .await
    }

    pub async fn send_pod_message(
        &self,
        pod_id: impl Into<Value>,
        message: &str,
    ) -> Result<(), ProtocolError> {
        self.send_event(&ClientEvent::new(
            EventKind::PodMessage,
            json!({ "podId": pod_id.into(), "message": message }),
        ))
        .await
    }

    /// Start the close handshake.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
