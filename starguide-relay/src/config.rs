//! Relay configuration.

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the WebSocket relay binds to
    pub ws_bind_addr: String,
    /// Address the HTTP API binds to
    pub http_bind_addr: String,
    /// Frames buffered per connection before new ones are dropped
    pub outbound_capacity: usize,
    /// Echo chat messages back to their sender
    pub echo_chat_to_sender: bool,
    /// Tell the sender when a battle invite has nowhere to go
    pub notify_undelivered_invites: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_bind_addr: "0.0.0.0:5001".to_string(),
            http_bind_addr: "0.0.0.0:5000".to_string(),
            outbound_capacity: 256,
            echo_chat_to_sender: true,
            notify_undelivered_invites: false,
        }
    }
}

impl RelayConfig {
    /// Loopback config with OS-assigned ports.
    pub fn local() -> Self {
        Self {
            ws_bind_addr: "127.0.0.1:0".to_string(),
            http_bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.ws_bind_addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddress("ws_bind_addr"));
        }
        if self.http_bind_addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddress("http_bind_addr"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("outbound_capacity must be at least 1")]
    ZeroCapacity,
    #[error("{0} must not be empty")]
    EmptyAddress(&'static str),
}
