//! Connection registry: which live sessions have joined, and as whom.
//!
//! Owned by the hub actor and mutated only from its task, so it carries no
//! lock of its own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::SessionId;

/// Client-supplied identity payload. Not validated, not unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserDescriptor(Value);

impl UserDescriptor {
    pub fn new(payload: Value) -> Self {
        Self(payload)
    }

    /// Display name, if the client sent one as `name` or `username`.
    pub fn name(&self) -> Option<&str> {
        self.0
            .get("name")
            .or_else(|| self.0.get("username"))
            .and_then(Value::as_str)
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    pub fn into_payload(self) -> Value {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<SessionId, UserDescriptor>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; returns the previous descriptor.
    pub fn register(
        &mut self,
        session: SessionId,
        descriptor: UserDescriptor,
    ) -> Option<UserDescriptor> {
        self.entries.insert(session, descriptor)
    }

    /// Remove if present. Absent entries are not an error: a connection may
    /// disconnect without ever having joined.
    pub fn unregister(&mut self, session: &SessionId) -> Option<UserDescriptor> {
        self.entries.remove(session)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.entries.contains_key(session)
    }

    pub fn get(&self, session: &SessionId) -> Option<&UserDescriptor> {
        self.entries.get(session)
    }
}
