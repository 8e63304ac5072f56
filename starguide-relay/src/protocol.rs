//! JSON event protocol spoken over the relay's WebSocket.
//!
//! Wire format (one UTF-8 text frame per event):
//! ```text
//! { "event": "<name>", "data": <free-form JSON> }
//! ```
//!
//! Inbound frames are decoded into a [`ClientEvent`]: the event name picks an
//! [`EventKind`] and `data` is kept verbatim. Outbound frames are
//! [`ServerEvent`]s, serialized adjacently tagged so that the same envelope
//! shape goes both ways.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque identifier of one live connection, assigned at transport connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ProtocolError::InvalidSessionId(s.to_string()))
    }
}

/// Kinds of event a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserJoined,
    ChatMessage,
    BattleInvite,
    JoinPod,
    LeavePod,
    PodMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::UserJoined,
        EventKind::ChatMessage,
        EventKind::BattleInvite,
        EventKind::JoinPod,
        EventKind::LeavePod,
        EventKind::PodMessage,
    ];

    /// Name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::UserJoined => "userJoined",
            EventKind::ChatMessage => "chatMessage",
            EventKind::BattleInvite => "battleInvite",
            EventKind::JoinPod => "joinPod",
            EventKind::LeavePod => "leavePod",
            EventKind::PodMessage => "podMessage",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded client event. The payload is never validated here.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub kind: EventKind,
    pub data: Value,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a str,
    data: &'a Value,
}

impl ClientEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let kind = EventKind::from_name(&envelope.event)
            .ok_or(ProtocolError::UnknownEvent(envelope.event))?;
        Ok(Self {
            kind,
            data: envelope.data,
        })
    }

    /// Encode into a text frame (client side).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(&OutboundEnvelope {
            event: self.kind.name(),
            data: &self.data,
        })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Greeting sent only to a freshly accepted connection.
    #[serde(rename_all = "camelCase")]
    Connected { message: String, session_id: SessionId },
    /// Current registry size.
    OnlineUsers(usize),
    /// Relayed chat payload, verbatim.
    ChatMessage(Value),
    /// Relayed battle invite payload, verbatim.
    BattleInvite(Value),
    #[serde(rename_all = "camelCase")]
    BattleInviteUndelivered { target_user_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    MemberJoined {
        pod_id: String,
        session_id: SessionId,
        user: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    MemberLeft { pod_id: String, session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    PodMessage {
        pod_id: String,
        session_id: SessionId,
        user: Option<Value>,
        message: String,
        timestamp: String,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::OnlineUsers(_) => "onlineUsers",
            ServerEvent::ChatMessage(_) => "chatMessage",
            ServerEvent::BattleInvite(_) => "battleInvite",
            ServerEvent::BattleInviteUndelivered { .. } => "battleInviteUndelivered",
            ServerEvent::MemberJoined { .. } => "memberJoined",
            ServerEvent::MemberLeft { .. } => "memberLeft",
            ServerEvent::PodMessage { .. } => "podMessage",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_known_events() {
        for kind in EventKind::ALL {
            let text = format!(r#"{{"event":"{}","data":{{"x":1}}}}"#, kind.name());
            let event = ClientEvent::decode(&text).unwrap();
            assert_eq!(event.kind, kind);
            assert_eq!(event.data, json!({"x": 1}));
        }
    }

    #[test]
    fn test_decode_missing_data_is_null() {
        let event = ClientEvent::decode(r#"{"event":"chatMessage"}"#).unwrap();
        assert_eq!(event.kind, EventKind::ChatMessage);
        assert!(event.data.is_null());
    }

    #[test]
    fn test_decode_unknown_event() {
        let err = ClientEvent::decode(r#"{"event":"teleport","data":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("teleport".into()));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            ClientEvent::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ClientEvent::decode(r#"[1,2,3]"#).is_err());
        assert!(ClientEvent::decode(r#"{"data":1}"#).is_err());
    }

    #[test]
    fn test_payload_passes_through_verbatim() {
        let payload = json!({"text": "hi", "nested": {"deep": [1, null, "x"]}, "extra": true});
        let event = ClientEvent::new(EventKind::ChatMessage, payload.clone());
        let decoded = ClientEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.data, payload);
    }

    #[test]
    fn test_server_event_wire_shape() {
        let online = ServerEvent::OnlineUsers(3).encode().unwrap();
        let value: Value = serde_json::from_str(&online).unwrap();
        assert_eq!(value, json!({"event": "onlineUsers", "data": 3}));

        let chat = ServerEvent::ChatMessage(json!({"text": "yo"})).encode().unwrap();
        let value: Value = serde_json::from_str(&chat).unwrap();
        assert_eq!(value, json!({"event": "chatMessage", "data": {"text": "yo"}}));
    }

    #[test]
    fn test_connected_uses_camel_case() {
        let sid = SessionId::new();
        let text = ServerEvent::Connected {
            message: "hello".into(),
            session_id: sid,
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "connected");
        assert_eq!(value["data"]["sessionId"], sid.to_string());

        match ServerEvent::decode(&text).unwrap() {
            ServerEvent::Connected { session_id, .. } => assert_eq!(session_id, sid),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_event_names_match_serde_tags() {
        let sid = SessionId::new();
        let events = vec![
            ServerEvent::OnlineUsers(0),
            ServerEvent::ChatMessage(Value::Null),
            ServerEvent::BattleInvite(Value::Null),
            ServerEvent::BattleInviteUndelivered { target_user_id: None },
            ServerEvent::MemberLeft { pod_id: "1".into(), session_id: sid },
        ];
        for event in events {
            let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
            assert_eq!(value["event"], event.name());
        }
    }

    #[test]
    fn test_session_id_parse() {
        let sid = SessionId::new();
        let parsed: SessionId = sid.to_string().parse().unwrap();
        assert_eq!(parsed, sid);
        assert!("nope".parse::<SessionId>().is_err());
    }
}
