//! Learning pods: transient, named groups of sessions that chat among
//! themselves. Membership lives only as long as the connections do.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::protocol::SessionId;

/// Normalise a client-supplied pod id. Strings are trimmed, numbers use
/// their JSON form; anything else is rejected.
pub fn pod_id(data: &Value) -> Option<String> {
    match data.get("podId")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct PodDirectory {
    pods: HashMap<String, BTreeSet<SessionId>>,
}

impl PodDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the session was not already a member.
    pub fn join(&mut self, pod: &str, session: SessionId) -> bool {
        self.pods.entry(pod.to_string()).or_default().insert(session)
    }

    /// Returns `true` if the session was a member.
    pub fn leave(&mut self, pod: &str, session: &SessionId) -> bool {
        let Some(members) = self.pods.get_mut(pod) else {
            return false;
        };
        let removed = members.remove(session);
        if members.is_empty() {
            self.pods.remove(pod);
        }
        removed
    }

    /// Drop the session from every pod; returns the pods it left.
    pub fn leave_all(&mut self, session: &SessionId) -> Vec<String> {
        let mut left = Vec::new();
        self.pods.retain(|pod, members| {
            if members.remove(session) {
                left.push(pod.clone());
            }
            !members.is_empty()
        });
        left.sort();
        left
    }

    pub fn members(&self, pod: &str) -> Vec<SessionId> {
        self.pods
            .get(pod)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, pod: &str, session: &SessionId) -> bool {
        self.pods.get(pod).is_some_and(|m| m.contains(session))
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }
}
