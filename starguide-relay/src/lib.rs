//! # starguide-relay: Real-time presence and message relay for StarGuide
//!
//! Tracks who is online and relays chat, battle invites and pod messages
//! between WebSocket clients. Nothing is persisted; all state lives in one
//! process for as long as the connections do.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌───────────────┐
//! │ RelayClient  │ ◄──────────────────► │ conn task     │
//! │ (per user)   │                      │ (per socket)  │
//! └──────────────┘                      └───────┬───────┘
//!                                               │ HubCommand
//!                                               ▼
//!                 ┌─────────────┐       ┌───────────────┐
//!                 │ HTTP API    │ ────► │ RelayHub      │
//!                 │ (axum)      │       │ (single task) │
//!                 └─────────────┘       └───────┬───────┘
//!                                               │
//!                    ┌──────────────┬───────────┼─────────────┐
//!                    ▼              ▼           ▼             ▼
//!              RoutingTable   Connection   Presence       PodDirectory
//!              (fan-out)      Registry     Broadcaster
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - JSON event envelope, session ids
//! - [`registry`] - joined sessions and their user descriptors
//! - [`broadcast`] - per-connection outbound queues and fan-out
//! - [`presence`] - online-count announcements
//! - [`relay`] - chat broadcast and targeted battle invites
//! - [`pods`] - transient pod membership
//! - [`hub`] - the actor that owns all of the above
//! - [`server`] - accept loop, connection tasks, graceful shutdown
//! - [`http`] - health, online count and progress endpoints
//! - [`client`] - WebSocket client

pub mod protocol;
pub mod registry;
pub mod broadcast;
pub mod presence;
pub mod relay;
pub mod pods;
pub mod hub;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientEvent, EventKind, ProtocolError, ServerEvent, SessionId};
pub use registry::{ConnectionRegistry, UserDescriptor};
pub use broadcast::{BroadcastStats, ConnectionSender, RoutingTable};
pub use presence::{PresenceBroadcaster, PresenceStats};
pub use relay::{EchoPolicy, InviteOutcome};
pub use pods::PodDirectory;
pub use hub::{HubStats, RelayHub, GREETING};
pub use config::{ConfigError, RelayConfig};
pub use error::RelayError;
pub use server::{BoundRelay, RelayServer};
pub use client::{ConnectionState, RelayClient};
