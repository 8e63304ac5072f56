//! Connection manager actor.
//!
//! One task owns every piece of shared relay state: the routing table, the
//! connection registry, the presence broadcaster and the pod directory.
//! Connection tasks and the HTTP layer reach it through [`RelayHub`], a
//! cheap-to-clone handle over an unbounded command channel. Commands run one
//! at a time in arrival order, so each handler sees a consistent view and
//! events from one connection are applied in the order they were read.
//!
//! ```text
//! conn task A ──┐                       ┌── RoutingTable ──► outbound queues
//! conn task B ──┼── HubCommand ──► HubActor ── ConnectionRegistry
//! HTTP API ─────┘    (mpsc)             ├── PresenceBroadcaster
//!                                       └── PodDirectory
//! ```

use std::net::SocketAddr;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{BroadcastStats, ConnectionSender, RoutingTable};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pods::{self, PodDirectory};
use crate::presence::{PresenceBroadcaster, PresenceStats};
use crate::protocol::{ClientEvent, EventKind, ProtocolError, ServerEvent, SessionId};
use crate::registry::{ConnectionRegistry, UserDescriptor};
use crate::relay::{self, EchoPolicy};

/// Greeting sent to every freshly accepted connection.
pub const GREETING: &str = "Connected to StarGuide server";

/// Point-in-time view of the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live transport connections
    pub connections: usize,
    /// Joined sessions (registry size)
    pub online_users: usize,
    pub active_pods: usize,
    pub connections_total: u64,
    pub events_handled: u64,
    pub broadcast: BroadcastStats,
    pub presence: PresenceStats,
}

enum HubCommand {
    Connect {
        session: SessionId,
        addr: Option<SocketAddr>,
        outbound: ConnectionSender,
    },
    Event {
        session: SessionId,
        event: ClientEvent,
    },
    Disconnect {
        session: SessionId,
    },
    OnlineCount {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the hub actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayHub {
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubCommand::Connect { session, .. } => write!(f, "Connect({session})"),
            HubCommand::Event { session, event } => write!(f, "Event({session}, {})", event.kind),
            HubCommand::Disconnect { session } => write!(f, "Disconnect({session})"),
            HubCommand::OnlineCount { .. } => f.write_str("OnlineCount"),
            HubCommand::Stats { .. } => f.write_str("Stats"),
            HubCommand::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl RelayHub {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: &RelayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = HubActor::new(config);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    fn send(&self, cmd: HubCommand) -> Result<(), RelayError> {
        self.cmd_tx.send(cmd).map_err(|_| RelayError::HubClosed)
    }

    /// Transport-level connect. Creates a route, not a registry entry.
    pub fn connect(
        &self,
        session: SessionId,
        addr: Option<SocketAddr>,
        outbound: ConnectionSender,
    ) -> Result<(), RelayError> {
        self.send(HubCommand::Connect {
            session,
            addr,
            outbound,
        })
    }

    pub fn dispatch(&self, session: SessionId, event: ClientEvent) -> Result<(), RelayError> {
        self.send(HubCommand::Event { session, event })
    }

    pub fn disconnect(&self, session: SessionId) -> Result<(), RelayError> {
        self.send(HubCommand::Disconnect { session })
    }

    /// Registry size as of the moment the hub handles the query.
    pub async fn online_count(&self) -> Result<usize, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::OnlineCount { reply })?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply })?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Finish queued commands, close every connection and stop the actor.
    /// Returns the number of connections closed.
    pub async fn shutdown(&self) -> Result<usize, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Shutdown { reply })?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

type Handler = fn(&mut HubActor, SessionId, Value) -> Result<(), ProtocolError>;

/// Client event dispatch table.
const DISPATCH: [(EventKind, Handler); 6] = [
    (EventKind::UserJoined, HubActor::on_user_joined as Handler),
    (EventKind::ChatMessage, HubActor::on_chat_message as Handler),
    (EventKind::BattleInvite, HubActor::on_battle_invite as Handler),
    (EventKind::JoinPod, HubActor::on_join_pod as Handler),
    (EventKind::LeavePod, HubActor::on_leave_pod as Handler),
    (EventKind::PodMessage, HubActor::on_pod_message as Handler),
];

fn handler_for(kind: EventKind) -> Option<Handler> {
    DISPATCH
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

struct HubActor {
    routes: RoutingTable,
    registry: ConnectionRegistry,
    presence: PresenceBroadcaster,
    pods: PodDirectory,
    echo: EchoPolicy,
    notify_undelivered: bool,
    connections_total: u64,
    events_handled: u64,
}

impl HubActor {
    fn new(config: &RelayConfig) -> Self {
        Self {
            routes: RoutingTable::new(),
            registry: ConnectionRegistry::new(),
            presence: PresenceBroadcaster::new(),
            pods: PodDirectory::new(),
            echo: EchoPolicy::from_flag(config.echo_chat_to_sender),
            notify_undelivered: config.notify_undelivered_invites,
            connections_total: 0,
            events_handled: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<HubCommand>) {
        log::debug!("Relay hub started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HubCommand::Connect {
                    session,
                    addr,
                    outbound,
                } => self.on_connect(session, addr, outbound),
                HubCommand::Event { session, event } => self.on_event(session, event),
                HubCommand::Disconnect { session } => self.on_disconnect(session),
                HubCommand::OnlineCount { reply } => {
                    let _ = reply.send(self.registry.size());
                }
                HubCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                HubCommand::Shutdown { reply } => {
                    let closed = self.routes.close_all("server shutting down");
                    log::info!("Relay hub stopping, closed {closed} connections");
                    let _ = reply.send(closed);
                    break;
                }
            }
        }
        log::debug!("Relay hub stopped");
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.routes.len(),
            online_users: self.registry.size(),
            active_pods: self.pods.pod_count(),
            connections_total: self.connections_total,
            events_handled: self.events_handled,
            broadcast: self.routes.stats(),
            presence: self.presence.stats(),
        }
    }

    fn on_connect(&mut self, session: SessionId, addr: Option<SocketAddr>, outbound: ConnectionSender) {
        if !self.routes.insert(session, outbound, addr) {
            log::warn!("Session {session} connected twice, route replaced");
        }
        self.connections_total += 1;
        log::info!(
            "Client connected: {session} ({})",
            addr.map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );

        let greeting = ServerEvent::Connected {
            message: GREETING.to_string(),
            session_id: session,
        };
        if let Err(e) = self.routes.send_to(&session, &greeting) {
            log::warn!("Failed to greet {session}: {e}");
        }
    }

    fn on_event(&mut self, session: SessionId, event: ClientEvent) {
        if !self.routes.contains(&session) {
            log::debug!("Dropping {} from {session}: connection already gone", event.kind);
            return;
        }
        let Some(handler) = handler_for(event.kind) else {
            log::debug!("No handler for {}", event.kind);
            return;
        };
        self.events_handled += 1;
        if let Err(e) = handler(self, session, event.data) {
            log::warn!("Handling {} from {session} failed: {e}", event.kind);
        }
    }

    fn on_disconnect(&mut self, session: SessionId) {
        let origin = self
            .routes
            .addr(&session)
            .map_or_else(|| "unknown".to_string(), |a| a.to_string());
        let age = self.routes.age(&session);
        let had_route = self.routes.remove(&session);

        for pod in self.pods.leave_all(&session) {
            let members = self.pods.members(&pod);
            let left = ServerEvent::MemberLeft {
                pod_id: pod,
                session_id: session,
            };
            if let Err(e) = self.routes.send_to_many(&members, &left) {
                log::warn!("Failed to announce {session} leaving a pod: {e}");
            }
        }

        let descriptor = self.registry.unregister(&session);
        if let Err(e) = self.presence.announce(&mut self.routes, self.registry.size()) {
            log::warn!("Presence broadcast after disconnect failed: {e}");
        }

        if had_route {
            log::info!(
                "Client disconnected: {session} ({origin}, open {:.1}s){}",
                age.unwrap_or_default().as_secs_f64(),
                descriptor
                    .as_ref()
                    .and_then(UserDescriptor::name)
                    .map(|n| format!(" ({n})"))
                    .unwrap_or_default()
            );
        }
    }

    fn on_user_joined(&mut self, session: SessionId, data: Value) -> Result<(), ProtocolError> {
        let descriptor = UserDescriptor::new(data);
        log::info!(
            "User joined on {session}: {}",
            descriptor.name().unwrap_or("anonymous")
        );
        self.registry.register(session, descriptor);
        self.presence.announce(&mut self.routes, self.registry.size())?;
        Ok(())
    }

    fn on_chat_message(&mut self, session: SessionId, data: Value) -> Result<(), ProtocolError> {
        relay::relay_chat_message(&mut self.routes, &session, data, self.echo)?;
        Ok(())
    }

    fn on_battle_invite(&mut self, session: SessionId, data: Value) -> Result<(), ProtocolError> {
        let outcome = relay::relay_battle_invite(&mut self.routes, data)?;
        if outcome.is_delivered() {
            log::debug!("Battle invite from {session}: {outcome:?}");
            return Ok(());
        }
        log::debug!("Battle invite from {session} not delivered: {outcome:?}");
        if self.notify_undelivered {
            let notice = ServerEvent::BattleInviteUndelivered {
                target_user_id: outcome.target_label(),
            };
            self.routes.send_to(&session, &notice)?;
        }
        Ok(())
    }

    fn on_join_pod(&mut self, session: SessionId, data: Value) -> Result<(), ProtocolError> {
        let Some(user) = self.registry.get(&session).map(|d| d.payload().clone()) else {
            log::debug!("joinPod from {session} before userJoined, ignored");
            return Ok(());
        };
        let Some(pod_id) = pods::pod_id(&data) else {
            log::debug!("joinPod from {session} without a usable podId");
            return Ok(());
        };
        if self.pods.is_member(&pod_id, &session) {
            log::debug!("{session} is already in pod {pod_id}");
            return Ok(());
        }
        self.pods.join(&pod_id, session);
        let members = self.pods.members(&pod_id);
        log::info!("{session} joined pod {pod_id} ({} members)", members.len());
        let joined = ServerEvent::MemberJoined {
            pod_id,
            session_id: session,
            user: Some(user),
        };
        self.routes.send_to_many(&members, &joined)?;
        Ok(())
    }

    fn on_leave_pod(&mut self, session: SessionId, data: Value) -> Result<(), ProtocolError> {
        let Some(pod_id) = pods::pod_id(&data) else {
            return Ok(());
        };
        if !self.pods.leave(&pod_id, &session) {
            return Ok(());
        }
        let members = self.pods.members(&pod_id);
        let left = ServerEvent::MemberLeft {
            pod_id,
            session_id: session,
        };
        self.routes.send_to_many(&members, &left)?;
        Ok(())
    }

    fn on_pod_message(&mut self, session: SessionId, data: Value) -> Result<(), ProtocolError> {
        let Some(user) = self.registry.get(&session).map(|d| d.payload().clone()) else {
            log::debug!("podMessage from {session} before userJoined, ignored");
            return Ok(());
        };
        let Some(pod_id) = pods::pod_id(&data) else {
            return Ok(());
        };
        let message = match data.get("message").and_then(Value::as_str).map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return Ok(()),
        };
        let members = self.pods.members(&pod_id);
        let event = ServerEvent::PodMessage {
            pod_id,
            session_id: session,
            user: Some(user),
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let delivered = self.routes.send_to_many(&members, &event)?;
        log::debug!("Pod message from {session} delivered to {delivered} members");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::tungstenite::Message;

    struct TestConn {
        id: SessionId,
        rx: mpsc::Receiver<Message>,
    }

    impl TestConn {
        /// Next decoded event, or `None` if nothing arrives quickly.
        async fn next(&mut self) -> Option<ServerEvent> {
            match timeout(Duration::from_millis(200), self.rx.recv()).await {
                Ok(Some(Message::Text(text))) => Some(ServerEvent::decode(text.as_str()).unwrap()),
                _ => None,
            }
        }

        async fn drain(&mut self) {
            while timeout(Duration::from_millis(20), self.rx.recv()).await.is_ok_and(|m| m.is_some()) {}
        }
    }

    async fn open(hub: &RelayHub) -> TestConn {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(32);
        hub.connect(id, None, tx).unwrap();
        let mut conn = TestConn { id, rx };
        match conn.next().await {
            Some(ServerEvent::Connected { session_id, message }) => {
                assert_eq!(session_id, id);
                assert_eq!(message, GREETING);
            }
            other => panic!("expected greeting, got {other:?}"),
        }
        conn
    }

    fn join(hub: &RelayHub, conn: &TestConn, name: &str) {
        hub.dispatch(conn.id, ClientEvent::new(EventKind::UserJoined, json!({"name": name})))
            .unwrap();
    }

    #[test]
    fn test_dispatch_table_covers_every_kind() {
        for kind in EventKind::ALL {
            assert!(handler_for(kind).is_some(), "no handler for {kind}");
        }
    }

    #[tokio::test]
    async fn test_connect_does_not_register() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let _a = open(&hub).await;
        assert_eq!(hub.online_count().await.unwrap(), 0);
        assert_eq!(hub.stats().await.unwrap().connections, 1);
    }

    #[tokio::test]
    async fn test_three_join_one_leaves() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        let mut b = open(&hub).await;
        let mut c = open(&hub).await;

        join(&hub, &a, "A");
        join(&hub, &b, "B");
        join(&hub, &c, "C");
        assert_eq!(hub.online_count().await.unwrap(), 3);

        // Every connection sees 1, 2, 3 in order.
        for conn in [&mut a, &mut b, &mut c] {
            for expected in 1..=3 {
                assert_eq!(conn.next().await, Some(ServerEvent::OnlineUsers(expected)));
            }
        }

        hub.disconnect(c.id).unwrap();
        assert_eq!(hub.online_count().await.unwrap(), 2);
        assert_eq!(a.next().await, Some(ServerEvent::OnlineUsers(2)));
        assert_eq!(b.next().await, Some(ServerEvent::OnlineUsers(2)));
        assert_eq!(c.next().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_without_join_keeps_count() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        let b = open(&hub).await;
        join(&hub, &a, "A");
        a.drain().await;

        hub.disconnect(b.id).unwrap();
        assert_eq!(hub.online_count().await.unwrap(), 1);
        // The count is re-announced unchanged.
        assert_eq!(a.next().await, Some(ServerEvent::OnlineUsers(1)));
    }

    #[tokio::test]
    async fn test_repeated_join_overwrites() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let a = open(&hub).await;
        join(&hub, &a, "A");
        join(&hub, &a, "A2");
        assert_eq!(hub.online_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_chat_echo_setting() {
        let config = RelayConfig {
            echo_chat_to_sender: false,
            ..RelayConfig::local()
        };
        let hub = RelayHub::spawn(&config);
        let mut a = open(&hub).await;
        let mut b = open(&hub).await;

        hub.dispatch(a.id, ClientEvent::new(EventKind::ChatMessage, json!({"text": "hey"})))
            .unwrap();
        assert_eq!(b.next().await, Some(ServerEvent::ChatMessage(json!({"text": "hey"}))));
        assert_eq!(a.next().await, None);
    }

    #[tokio::test]
    async fn test_undelivered_invite_notice() {
        let config = RelayConfig {
            notify_undelivered_invites: true,
            ..RelayConfig::local()
        };
        let hub = RelayHub::spawn(&config);
        let mut a = open(&hub).await;
        let ghost = SessionId::new().to_string();

        hub.dispatch(
            a.id,
            ClientEvent::new(EventKind::BattleInvite, json!({"targetUserId": ghost})),
        )
        .unwrap();
        assert_eq!(
            a.next().await,
            Some(ServerEvent::BattleInviteUndelivered {
                target_user_id: Some(ghost)
            })
        );
    }

    #[tokio::test]
    async fn test_undelivered_invite_silent_by_default() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        hub.dispatch(
            a.id,
            ClientEvent::new(EventKind::BattleInvite, json!({"targetUserId": "nobody"})),
        )
        .unwrap();
        assert_eq!(a.next().await, None);
    }

    #[tokio::test]
    async fn test_pods_are_scoped() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        let mut b = open(&hub).await;
        let mut c = open(&hub).await;
        for (conn, name) in [(&a, "A"), (&b, "B"), (&c, "C")] {
            join(&hub, conn, name);
        }
        for conn in [&mut a, &mut b, &mut c] {
            conn.drain().await;
        }

        hub.dispatch(a.id, ClientEvent::new(EventKind::JoinPod, json!({"podId": 7}))).unwrap();
        match a.next().await {
            Some(ServerEvent::MemberJoined { pod_id, session_id, user }) => {
                assert_eq!(pod_id, "7");
                assert_eq!(session_id, a.id);
                assert_eq!(user, Some(json!({"name": "A"})));
            }
            other => panic!("expected memberJoined, got {other:?}"),
        }
        hub.dispatch(b.id, ClientEvent::new(EventKind::JoinPod, json!({"podId": "7"}))).unwrap();
        assert!(matches!(a.next().await, Some(ServerEvent::MemberJoined { .. })));
        assert!(matches!(b.next().await, Some(ServerEvent::MemberJoined { .. })));

        hub.dispatch(
            a.id,
            ClientEvent::new(EventKind::PodMessage, json!({"podId": 7, "message": "  hi pod "})),
        )
        .unwrap();
        for conn in [&mut a, &mut b] {
            match conn.next().await {
                Some(ServerEvent::PodMessage { message, pod_id, .. }) => {
                    assert_eq!(message, "hi pod");
                    assert_eq!(pod_id, "7");
                }
                other => panic!("expected podMessage, got {other:?}"),
            }
        }
        assert_eq!(c.next().await, None);

        // Blank messages are dropped.
        hub.dispatch(
            a.id,
            ClientEvent::new(EventKind::PodMessage, json!({"podId": 7, "message": "   "})),
        )
        .unwrap();
        assert_eq!(b.next().await, None);

        // Disconnect announces memberLeft to the rest of the pod.
        hub.disconnect(a.id).unwrap();
        assert_eq!(
            b.next().await,
            Some(ServerEvent::MemberLeft {
                pod_id: "7".into(),
                session_id: a.id
            })
        );
        assert_eq!(hub.stats().await.unwrap().active_pods, 1);
    }

    #[tokio::test]
    async fn test_pod_rejoin_is_not_announced_twice() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        let mut b = open(&hub).await;
        join(&hub, &a, "A");
        join(&hub, &b, "B");
        for conn in [&mut a, &mut b] {
            conn.drain().await;
        }

        for conn in [&a, &b] {
            hub.dispatch(conn.id, ClientEvent::new(EventKind::JoinPod, json!({"podId": "geo"})))
                .unwrap();
        }
        a.drain().await;
        b.drain().await;

        hub.dispatch(a.id, ClientEvent::new(EventKind::JoinPod, json!({"podId": " geo "})))
            .unwrap();
        assert_eq!(b.next().await, None);
        assert_eq!(a.next().await, None);
        assert_eq!(hub.stats().await.unwrap().active_pods, 1);
    }

    #[tokio::test]
    async fn test_pod_requires_join() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        hub.dispatch(a.id, ClientEvent::new(EventKind::JoinPod, json!({"podId": "x"}))).unwrap();
        assert_eq!(a.next().await, None);
        assert_eq!(hub.stats().await.unwrap().active_pods, 0);
    }

    #[tokio::test]
    async fn test_events_after_disconnect_are_ignored() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let a = open(&hub).await;
        hub.disconnect(a.id).unwrap();
        join(&hub, &a, "late");
        assert_eq!(hub.online_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let hub = RelayHub::spawn(&RelayConfig::local());
        let mut a = open(&hub).await;
        let _b = open(&hub).await;
        join(&hub, &a, "A");

        assert_eq!(hub.shutdown().await.unwrap(), 2);
        // The join queued ahead of shutdown still completed.
        assert_eq!(a.next().await, Some(ServerEvent::OnlineUsers(1)));
        assert!(matches!(a.rx.recv().await, Some(Message::Close(_))));
        assert!(a.rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!hub.is_running());
        assert!(matches!(hub.online_count().await, Err(RelayError::HubClosed)));
    }
}
