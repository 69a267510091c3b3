//! Room struct definition
//!
//! Represents a named chat room and the live delivery handles of its members.

use std::collections::HashMap;

use tracing::warn;

use crate::delivery::DeliveryHandle;
use crate::error::SendError;
use crate::message::{ChatMessage, RoomInfo, RoomSummary};
use crate::types::{current_timestamp, RoomId, SessionToken, UserId};

/// Result of delivering one message
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Handles that accepted the message
    pub delivered: usize,
    /// Members removed because their queue was full
    pub evicted: Vec<UserId>,
}

/// Multi-user chat room
///
/// Membership is the key set of `sessions`: a user is a member exactly
/// when it holds one delivery handle here.
#[derive(Debug)]
pub struct Room {
    /// Room ID
    pub id: RoomId,
    /// Room name, unique among rooms
    pub name: String,
    /// Room creation time (unix seconds)
    pub created_at: i64,
    /// Member → live delivery handle
    sessions: HashMap<UserId, DeliveryHandle>,
}

impl Room {
    /// Create an empty room
    pub fn new(id: RoomId, name: String) -> Self {
        Self {
            id,
            name,
            created_at: current_timestamp(),
            sessions: HashMap::new(),
        }
    }

    /// Check if a user is a member
    pub fn contains(&self, user_id: UserId) -> bool {
        self.sessions.contains_key(&user_id)
    }

    /// Number of members
    pub fn member_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current member ids
    pub fn member_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.sessions.keys().copied()
    }

    /// Bind a member's delivery handle
    ///
    /// At most one handle per user: a second join replaces the first,
    /// which is returned.
    pub fn insert_session(&mut self, user_id: UserId, handle: DeliveryHandle) -> Option<DeliveryHandle> {
        self.sessions.insert(user_id, handle)
    }

    /// Remove a member regardless of which subscription it holds
    ///
    /// Returns false if the user was already absent.
    pub fn remove_member(&mut self, user_id: UserId) -> bool {
        self.sessions.remove(&user_id).is_some()
    }

    /// Remove a member only if its handle belongs to `token`
    ///
    /// A subscription that was replaced by a later join, or removed by an
    /// explicit leave, finds nothing to remove.
    pub fn remove_session(&mut self, user_id: UserId, token: SessionToken) -> bool {
        match self.sessions.get(&user_id) {
            Some(handle) if handle.token() == token => {
                self.sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Deliver a message to every member
    ///
    /// A closed handle is logged and skipped; its stream is already ending
    /// and its session will depart on its own. A member whose queue is full
    /// has fallen behind and is evicted, so no member is left holding a
    /// stream with gaps.
    pub fn broadcast(&mut self, msg: &ChatMessage) -> Fanout {
        let mut fanout = Fanout::default();
        for (&user_id, handle) in &self.sessions {
            match self.push(user_id, handle, msg) {
                Ok(()) => fanout.delivered += 1,
                Err(SendError::QueueFull) => fanout.evicted.push(user_id),
                Err(SendError::ChannelClosed) => {}
            }
        }
        self.evict(&fanout.evicted);
        fanout
    }

    /// Deliver a message to one member's handle
    ///
    /// Returns None if the user has no handle in this room.
    pub fn deliver_to(&mut self, user_id: UserId, msg: &ChatMessage) -> Option<Fanout> {
        let handle = self.sessions.get(&user_id)?;
        let mut fanout = Fanout::default();
        match self.push(user_id, handle, msg) {
            Ok(()) => fanout.delivered = 1,
            Err(SendError::QueueFull) => fanout.evicted.push(user_id),
            Err(SendError::ChannelClosed) => {}
        }
        self.evict(&fanout.evicted);
        Some(fanout)
    }

    fn push(&self, user_id: UserId, handle: &DeliveryHandle, msg: &ChatMessage) -> Result<(), SendError> {
        handle.deliver(msg).inspect_err(|e| {
            warn!(
                "Failed to deliver message {} to user {} in room {}: {}",
                msg.id, user_id, self.id, e
            )
        })
    }

    fn evict(&mut self, users: &[UserId]) {
        for user_id in users {
            // Dropping the handle closes the queue and ends the stream
            self.sessions.remove(user_id);
            warn!("Evicted user {} from room {}: delivery queue full", user_id, self.id);
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id,
            name: self.name.clone(),
            member_count: self.member_count(),
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id,
            name: self.name.clone(),
            member_count: self.member_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::types::MessageId;

    fn handle(token: u64) -> (DeliveryHandle, mpsc::Receiver<ChatMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (DeliveryHandle::new(SessionToken(token), tx), rx)
    }

    fn hello() -> ChatMessage {
        ChatMessage::broadcast(MessageId(1), RoomId(1), "alice", "hello".to_string())
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new(RoomId(1), "general".to_string());

        assert_eq!(room.id, RoomId(1));
        assert_eq!(room.name, "general");
        assert_eq!(room.member_count(), 0);
        assert!(room.created_at > 0);
    }

    #[test]
    fn test_room_membership_follows_sessions() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(2);

        room.insert_session(UserId(1), h1);
        room.insert_session(UserId(2), h2);

        assert!(room.contains(UserId(1)));
        assert!(room.contains(UserId(2)));
        assert_eq!(room.member_count(), 2);

        let mut ids: Vec<_> = room.member_ids().collect();
        ids.sort();
        assert_eq!(ids, vec![UserId(1), UserId(2)]);
    }

    #[test]
    fn test_second_join_replaces_handle() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(2);

        assert!(room.insert_session(UserId(1), h1).is_none());
        let old = room.insert_session(UserId(1), h2).unwrap();
        assert_eq!(old.token(), SessionToken(1));
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_remove_member_is_idempotent() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (h1, _rx1) = handle(1);
        room.insert_session(UserId(1), h1);

        assert!(room.remove_member(UserId(1)));
        assert!(!room.remove_member(UserId(1)));
        assert!(!room.contains(UserId(1)));
    }

    #[test]
    fn test_remove_session_checks_token() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(2);
        room.insert_session(UserId(1), h1);
        room.insert_session(UserId(1), h2);

        // The replaced subscription must not evict the new one
        assert!(!room.remove_session(UserId(1), SessionToken(1)));
        assert!(room.contains(UserId(1)));

        assert!(room.remove_session(UserId(1), SessionToken(2)));
        assert!(!room.contains(UserId(1)));
    }

    #[tokio::test]
    async fn test_broadcast_skips_broken_handles() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (h1, mut rx1) = handle(1);
        let (h2, rx2) = handle(2);
        let (h3, mut rx3) = handle(3);
        room.insert_session(UserId(1), h1);
        room.insert_session(UserId(2), h2);
        room.insert_session(UserId(3), h3);
        drop(rx2);

        let fanout = room.broadcast(&hello());
        assert_eq!(fanout.delivered, 2);
        assert!(fanout.evicted.is_empty());
        assert_eq!(rx1.recv().await.unwrap().content, "hello");
        assert_eq!(rx3.recv().await.unwrap().content, "hello");

        // A closed handle is left for its own session to clean up
        assert!(room.contains(UserId(2)));
    }

    #[tokio::test]
    async fn test_broadcast_evicts_full_queue() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (tx, mut slow_rx) = mpsc::channel(1);
        room.insert_session(UserId(1), DeliveryHandle::new(SessionToken(1), tx));
        let (h2, mut rx2) = handle(2);
        room.insert_session(UserId(2), h2);

        assert_eq!(room.broadcast(&hello()).delivered, 2);
        let fanout = room.broadcast(&hello());
        assert_eq!(fanout.delivered, 1);
        assert_eq!(fanout.evicted, vec![UserId(1)]);
        assert!(!room.contains(UserId(1)));
        assert_eq!(room.member_count(), 1);

        // The evicted stream ends after what was already queued
        assert_eq!(slow_rx.recv().await.unwrap().content, "hello");
        assert!(slow_rx.recv().await.is_none());
        assert_eq!(rx2.recv().await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn test_deliver_to_single_member() {
        let mut room = Room::new(RoomId(1), "general".to_string());
        let (h1, mut rx1) = handle(1);
        room.insert_session(UserId(1), h1);

        assert_eq!(room.deliver_to(UserId(1), &hello()).unwrap().delivered, 1);
        assert!(room.deliver_to(UserId(2), &hello()).is_none());
        assert_eq!(rx1.recv().await.unwrap().username, "alice");
    }
}
