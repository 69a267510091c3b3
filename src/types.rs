//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `UserId`, `RoomId`, `MessageId`: allocator-issued integer identifiers
//! - `SessionToken`: identifies one (user, room) subscription
//! - `ConnectionId`: UUID-based identifier for a WebSocket connection

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Unique user identifier
    UserId
);
integer_id!(
    /// Unique room identifier
    RoomId
);
integer_id!(
    /// Unique message identifier, shared by every room and by direct messages
    MessageId
);
integer_id!(
    /// Identifies one subscription, so a stale stream cannot evict its replacement
    SessionToken
);

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. Only used to correlate log lines for one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time as unix seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
