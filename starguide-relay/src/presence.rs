//! Online-count announcements.
//!
//! After every registry change the hub hands the new size to
//! [`PresenceBroadcaster::announce`], which fans `onlineUsers` out to every
//! live route, the triggering connection included.

use crate::broadcast::RoutingTable;
use crate::protocol::{ProtocolError, ServerEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStats {
    pub announcements: u64,
    pub last_count: Option<usize>,
}

#[derive(Debug, Default)]
pub struct PresenceBroadcaster {
    stats: PresenceStats,
}

impl PresenceBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast `count` to all routes. Returns how many received it.
    pub fn announce(&mut self, routes: &mut RoutingTable, count: usize) -> Result<usize, ProtocolError> {
        let delivered = routes.broadcast(&ServerEvent::OnlineUsers(count))?;
        self.stats.announcements += 1;
        self.stats.last_count = Some(count);
        log::debug!("Online count {count} announced to {delivered} connections");
        Ok(delivered)
    }

    pub fn stats(&self) -> PresenceStats {
        self.stats
    }
}
