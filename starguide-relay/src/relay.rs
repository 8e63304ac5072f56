//! Chat fan-out and targeted battle invites.
//!
//! Neither path inspects the payload beyond what routing needs: chat is
//! forwarded verbatim, invites only read `targetUserId`.

use serde_json::Value;

use crate::broadcast::RoutingTable;
use crate::protocol::{ProtocolError, ServerEvent, SessionId};

/// Whether a chat sender receives its own message back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoPolicy {
    IncludeSender,
    ExcludeSender,
}

impl EchoPolicy {
    pub fn from_flag(echo_to_sender: bool) -> Self {
        if echo_to_sender {
            EchoPolicy::IncludeSender
        } else {
            EchoPolicy::ExcludeSender
        }
    }
}

/// Where a battle invite ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    Delivered(SessionId),
    /// `targetUserId` missing or not a string.
    MissingTarget,
    /// `targetUserId` present but not a session id.
    MalformedTarget(String),
    /// Well-formed id with no live connection behind it.
    TargetOffline(SessionId),
}

impl InviteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, InviteOutcome::Delivered(_))
    }

    /// Raw target as sent by the client, for the undelivered notice.
    pub fn target_label(&self) -> Option<String> {
        match self {
            InviteOutcome::Delivered(id) | InviteOutcome::TargetOffline(id) => Some(id.to_string()),
            InviteOutcome::MalformedTarget(raw) => Some(raw.clone()),
            InviteOutcome::MissingTarget => None,
        }
    }
}

/// Broadcast a chat payload verbatim. Returns the recipient count.
pub fn relay_chat_message(
    routes: &mut RoutingTable,
    sender: &SessionId,
    payload: Value,
    echo: EchoPolicy,
) -> Result<usize, ProtocolError> {
    let event = ServerEvent::ChatMessage(payload);
    let delivered = match echo {
        EchoPolicy::IncludeSender => routes.broadcast(&event)?,
        EchoPolicy::ExcludeSender => routes.broadcast_except(&event, sender)?,
    };
    log::debug!("Chat from {sender} relayed to {delivered} connections");
    Ok(delivered)
}

/// Extract the target from the payload without validating anything else.
pub fn invite_target(payload: &Value) -> Result<SessionId, InviteOutcome> {
    let raw = payload
        .get("targetUserId")
        .and_then(Value::as_str)
        .ok_or(InviteOutcome::MissingTarget)?;
    raw.parse()
        .map_err(|_| InviteOutcome::MalformedTarget(raw.to_string()))
}

/// Route a battle invite to exactly one connection, or nowhere.
pub fn relay_battle_invite(
    routes: &mut RoutingTable,
    payload: Value,
) -> Result<InviteOutcome, ProtocolError> {
    let target = match invite_target(&payload) {
        Ok(target) => target,
        Err(outcome) => return Ok(outcome),
    };
    if routes.send_to(&target, &ServerEvent::BattleInvite(payload))? {
        Ok(InviteOutcome::Delivered(target))
    } else {
        Ok(InviteOutcome::TargetOffline(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    struct Peer {
        id: SessionId,
        rx: mpsc::Receiver<Message>,
    }

    fn peers(routes: &mut RoutingTable, n: usize) -> Vec<Peer> {
        (0..n)
            .map(|_| {
                let id = SessionId::new();
                let (tx, rx) = mpsc::channel(8);
                routes.insert(id, tx, None);
                Peer { id, rx }
            })
            .collect()
    }

    fn next(peer: &mut Peer) -> Option<ServerEvent> {
        match peer.rx.try_recv().ok()? {
            Message::Text(text) => Some(ServerEvent::decode(text.as_str()).unwrap()),
            _ => None,
        }
    }

    #[test]
    fn test_chat_includes_sender() {
        let mut routes = RoutingTable::new();
        let mut ps = peers(&mut routes, 3);
        let payload = json!({"text": "hi", "from": "A"});

        let n = relay_chat_message(&mut routes, &ps[0].id, payload.clone(), EchoPolicy::IncludeSender)
            .unwrap();
        assert_eq!(n, 3);
        for p in ps.iter_mut() {
            assert_eq!(next(p), Some(ServerEvent::ChatMessage(payload.clone())));
        }
    }

    #[test]
    fn test_chat_excludes_sender() {
        let mut routes = RoutingTable::new();
        let mut ps = peers(&mut routes, 3);
        let sender = ps[0].id;

        let n = relay_chat_message(&mut routes, &sender, json!("x"), EchoPolicy::ExcludeSender).unwrap();
        assert_eq!(n, 2);
        assert_eq!(next(&mut ps[0]), None);
        assert!(next(&mut ps[1]).is_some());
        assert!(next(&mut ps[2]).is_some());
    }

    #[test]
    fn test_invite_reaches_only_target() {
        let mut routes = RoutingTable::new();
        let mut ps = peers(&mut routes, 3);
        let target = ps[2].id;
        let payload = json!({"targetUserId": target.to_string(), "topic": "algebra"});

        let outcome = relay_battle_invite(&mut routes, payload.clone()).unwrap();
        assert_eq!(outcome, InviteOutcome::Delivered(target));
        assert_eq!(next(&mut ps[0]), None);
        assert_eq!(next(&mut ps[1]), None);
        assert_eq!(next(&mut ps[2]), Some(ServerEvent::BattleInvite(payload)));
    }

    #[test]
    fn test_invite_to_offline_target_is_noop() {
        let mut routes = RoutingTable::new();
        let mut ps = peers(&mut routes, 2);
        let ghost = SessionId::new();

        let outcome =
            relay_battle_invite(&mut routes, json!({"targetUserId": ghost.to_string()})).unwrap();
        assert_eq!(outcome, InviteOutcome::TargetOffline(ghost));
        assert!(!outcome.is_delivered());
        for p in ps.iter_mut() {
            assert_eq!(next(p), None);
        }
    }

    #[test]
    fn test_invite_bad_targets() {
        let mut routes = RoutingTable::new();
        assert_eq!(
            relay_battle_invite(&mut routes, json!({"topic": "x"})).unwrap(),
            InviteOutcome::MissingTarget
        );
        assert_eq!(
            relay_battle_invite(&mut routes, json!({"targetUserId": 17})).unwrap(),
            InviteOutcome::MissingTarget
        );
        let outcome = relay_battle_invite(&mut routes, json!({"targetUserId": "bob"})).unwrap();
        assert_eq!(outcome, InviteOutcome::MalformedTarget("bob".into()));
        assert_eq!(outcome.target_label().as_deref(), Some("bob"));
        assert_eq!(
            relay_battle_invite(&mut routes, Value::Null).unwrap(),
            InviteOutcome::MissingTarget
        );
    }

    #[test]
    fn test_echo_policy_from_flag() {
        assert_eq!(EchoPolicy::from_flag(true), EchoPolicy::IncludeSender);
        assert_eq!(EchoPolicy::from_flag(false), EchoPolicy::ExcludeSender);
    }
}
