//! Transport routing table and fan-out.
//!
//! Every live connection, joined or not, has one bounded outbound channel
//! drained by its writer task. Fan-out encodes the event once and enqueues a
//! clone of the frame per recipient with `try_send`, so the hub never waits
//! on a slow socket. A full or closed channel drops the frame for that
//! recipient only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, ServerEvent, SessionId};

/// Sender half of a connection's outbound queue.
pub type ConnectionSender = mpsc::Sender<Message>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_routes: usize,
}

#[derive(Debug)]
struct Route {
    sender: ConnectionSender,
    addr: Option<SocketAddr>,
    connected_at: Instant,
}

/// Live connections keyed by session id.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<SessionId, Route>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Returns `false` if the session already had one, which is
    /// replaced.
    pub fn insert(
        &mut self,
        session: SessionId,
        sender: ConnectionSender,
        addr: Option<SocketAddr>,
    ) -> bool {
        let route = Route {
            sender,
            addr,
            connected_at: Instant::now(),
        };
        self.routes.insert(session, route).is_none()
    }

    pub fn remove(&mut self, session: &SessionId) -> bool {
        self.routes.remove(session).is_some()
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.routes.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn addr(&self, session: &SessionId) -> Option<SocketAddr> {
        self.routes.get(session).and_then(|r| r.addr)
    }

    /// How long a route has been open.
    pub fn age(&self, session: &SessionId) -> Option<std::time::Duration> {
        self.routes.get(session).map(|r| r.connected_at.elapsed())
    }

    /// Send to every route. Returns the number of recipients the frame was
    /// enqueued for.
    pub fn broadcast(&mut self, event: &ServerEvent) -> Result<usize, ProtocolError> {
        self.broadcast_filtered(event, |_| true)
    }

    /// Send to every route except `skip`.
    pub fn broadcast_except(
        &mut self,
        event: &ServerEvent,
        skip: &SessionId,
    ) -> Result<usize, ProtocolError> {
        self.broadcast_filtered(event, |session| session != skip)
    }

    fn broadcast_filtered<F>(&mut self, event: &ServerEvent, keep: F) -> Result<usize, ProtocolError>
    where
        F: Fn(&SessionId) -> bool,
    {
        let frame = Message::text(event.encode()?);
        let mut delivered = 0;
        let mut dropped = 0;
        for (session, route) in self.routes.iter().filter(|(s, _)| keep(s)) {
            if Self::enqueue(session, &route.sender, frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        self.messages_sent += delivered as u64;
        self.messages_dropped += dropped;
        Ok(delivered)
    }

    /// Send to one route. `Ok(false)` when the session has no live route.
    pub fn send_to(&mut self, session: &SessionId, event: &ServerEvent) -> Result<bool, ProtocolError> {
        let Some(route) = self.routes.get(session) else {
            return Ok(false);
        };
        let frame = Message::text(event.encode()?);
        if Self::enqueue(session, &route.sender, frame) {
            self.messages_sent += 1;
        } else {
            self.messages_dropped += 1;
        }
        Ok(true)
    }

    /// Send to each listed session that still has a route.
    pub fn send_to_many<'a, I>(&mut self, sessions: I, event: &ServerEvent) -> Result<usize, ProtocolError>
    where
        I: IntoIterator<Item = &'a SessionId>,
    {
        let frame = Message::text(event.encode()?);
        let mut delivered = 0;
        for session in sessions {
            let Some(route) = self.routes.get(session) else {
                continue;
            };
            if Self::enqueue(session, &route.sender, frame.clone()) {
                delivered += 1;
                self.messages_sent += 1;
            } else {
                self.messages_dropped += 1;
            }
        }
        Ok(delivered)
    }

    /// Queue a close frame on every route and forget them all.
    ///
    /// Uses `try_send` like every other path; a connection whose queue is
    /// full still closes because its sender is dropped here.
    pub fn close_all(&mut self, reason: &str) -> usize {
        let frame = Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: reason.to_string().into(),
        }));
        let count = self.routes.len();
        for (session, route) in self.routes.drain() {
            let _ = Self::enqueue(&session, &route.sender, frame.clone());
        }
        count
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_routes: self.routes.len(),
        }
    }

    fn enqueue(session: &SessionId, sender: &ConnectionSender, frame: Message) -> bool {
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue full for {session}, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Outbound queue closed for {session}, dropping frame");
                false
            }
        }
    }
}
