//! Room and session registry
//!
//! The shared state behind every RPC: the user directory, the rooms and
//! the live delivery handles of their members, all under one
//! readers-writer lock. Lookups take the read side. Anything that mutates
//! membership or the directory, or fans out a message, takes the write
//! side for its whole critical section, so deliveries to one room never
//! interleave.
//!
//! Fan-out only enqueues on each handle's bounded queue; draining to the
//! socket happens outside the lock (see `session`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::credentials::{Argon2Hasher, CredentialHasher};
use crate::delivery::DeliveryHandle;
use crate::directory::{RenameOutcome, User, UserDirectory};
use crate::error::ChatError;
use crate::ids::Allocators;
use crate::message::{ChatMessage, RoomInfo, RoomSummary, UserInfo};
use crate::room::Room;
use crate::types::{RoomId, SessionToken, UserId};

/// Identity returned by CreateUser and LoginUser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    pub username: String,
}

/// Business outcome that is reported rather than raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
        }
    }

    fn refused(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

/// Acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub status: String,
    pub timestamp: i64,
}

impl Receipt {
    fn sent(timestamp: i64) -> Self {
        Self {
            status: "sent".to_string(),
            timestamp,
        }
    }
}

/// How the end of a subscription's stream was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The subscription was removed and its departure announced
    Removed,
    /// The user is still in the room under a newer subscription
    Replaced,
    /// Nothing left to remove
    Absent,
}

#[derive(Debug, Default)]
struct RegistryState {
    users: UserDirectory,
    rooms: HashMap<RoomId, Room>,
}

impl RegistryState {
    fn user(&self, user_id: UserId) -> Result<&User, ChatError> {
        self.users
            .get(user_id)
            .ok_or_else(|| ChatError::NotFound("user not found".to_string()))
    }

    fn room(&self, room_id: RoomId) -> Result<&Room, ChatError> {
        self.rooms
            .get(&room_id)
            .ok_or_else(|| ChatError::NotFound("room not found".to_string()))
    }
}

/// The registry shared by every connection
pub struct ChatRegistry {
    state: RwLock<RegistryState>,
    ids: Allocators,
    hasher: Arc<dyn CredentialHasher>,
}

impl Default for ChatRegistry {
    fn default() -> Self {
        Self::new(Arc::new(Argon2Hasher))
    }
}

impl ChatRegistry {
    /// Create an empty registry using the given credential hasher
    pub fn new(hasher: Arc<dyn CredentialHasher>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            ids: Allocators::default(),
            hasher,
        }
    }

    /// Token for a new subscription
    pub fn next_session_token(&self) -> SessionToken {
        self.ids.sessions.next()
    }

    /// Register an account
    ///
    /// Hashing runs on the blocking pool before the lock is taken; the
    /// uniqueness check is repeated under the lock.
    pub async fn create_user(&self, username: String, password: String) -> Result<Account, ChatError> {
        if username.is_empty() || password.is_empty() {
            return Err(ChatError::InvalidArgument(
                "username and password are required".to_string(),
            ));
        }

        if self.state.read().await.users.contains_name(&username) {
            return Err(ChatError::AlreadyExists("username already exists".to_string()));
        }

        let hasher = Arc::clone(&self.hasher);
        let credential = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| ChatError::Internal(format!("hashing task failed: {}", e)))??;

        let mut state = self.state.write().await;
        if state.users.contains_name(&username) {
            return Err(ChatError::AlreadyExists("username already exists".to_string()));
        }
        let user_id = self.ids.users.next();
        state.users.insert(User::new(user_id, username.clone(), credential))?;

        info!("User {} created as '{}'", user_id, username);
        debug!("Total users: {}", state.users.len());
        Ok(Account { user_id, username })
    }

    /// Authenticate an account by name and password
    pub async fn login_user(&self, username: &str, password: String) -> Result<Account, ChatError> {
        let denied = || ChatError::Unauthenticated("invalid username or password".to_string());

        let (user_id, credential) = {
            let state = self.state.read().await;
            let user = state.users.find_by_name(username).ok_or_else(denied)?;
            (user.id, user.credential.clone())
        };

        let hasher = Arc::clone(&self.hasher);
        let valid = tokio::task::spawn_blocking(move || hasher.verify(&password, &credential))
            .await
            .map_err(|e| ChatError::Internal(format!("verification task failed: {}", e)))??;
        if !valid {
            debug!("Rejected login for '{}'", username);
            return Err(denied());
        }

        let mut state = self.state.write().await;
        state.users.touch(user_id);
        // A rename may have landed between verification and now
        let username = state.user(user_id)?.username.clone();

        info!("User {} logged in as '{}'", user_id, username);
        Ok(Account { user_id, username })
    }

    /// Create an empty room with a unique name
    pub async fn create_room(&self, name: &str) -> Result<RoomId, ChatError> {
        if name.is_empty() {
            return Err(ChatError::InvalidArgument("room name cannot be empty".to_string()));
        }

        let mut state = self.state.write().await;
        if state.rooms.values().any(|room| room.name == name) {
            return Err(ChatError::AlreadyExists("room name already exists".to_string()));
        }

        let room_id = self.ids.rooms.next();
        state.rooms.insert(room_id, Room::new(room_id, name.to_string()));

        info!("Room {} created as '{}'", room_id, name);
        debug!("Total rooms: {}", state.rooms.len());
        Ok(room_id)
    }

    pub async fn get_room_info(&self, room_id: RoomId) -> Result<RoomInfo, ChatError> {
        let state = self.state.read().await;
        Ok(state.room(room_id)?.info())
    }

    /// Every room, ordered by id
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let state = self.state.read().await;
        let mut rooms: Vec<_> = state.rooms.values().map(Room::summary).collect();
        rooms.sort_by_key(|room| room.room_id);
        rooms
    }

    /// Current member ids of a room, ordered by id
    #[cfg(test)]
    pub(crate) async fn members(&self, room_id: RoomId) -> Result<Vec<UserId>, ChatError> {
        let state = self.state.read().await;
        let mut ids: Vec<_> = state.room(room_id)?.member_ids().collect();
        ids.sort();
        Ok(ids)
    }

    /// Admit a user into a room and announce it to every member, the
    /// joiner included
    pub(crate) async fn admit(
        &self,
        user_id: UserId,
        room_id: RoomId,
        handle: DeliveryHandle,
    ) -> Result<(), ChatError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let username = state.user(user_id)?.username.clone();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ChatError::NotFound("room not found".to_string()))?;

        if let Some(previous) = room.insert_session(user_id, handle) {
            debug!(
                "User {} rejoined room {}, replacing subscription {}",
                user_id,
                room_id,
                previous.token()
            );
        }
        state.users.touch(user_id);

        let notice = ChatMessage::system(
            self.ids.messages.next(),
            room_id,
            format!("{} has joined the room", username),
        );
        self.fan_out(&state.users, room, &notice);

        info!("User {} joined room {}", user_id, room_id);
        Ok(())
    }

    /// Remove a subscription whose stream ended
    ///
    /// No-op if the membership was already removed by an explicit leave or
    /// an eviction, or taken over by a newer subscription.
    pub(crate) async fn depart(&self, user_id: UserId, room_id: RoomId, token: SessionToken) -> Departure {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(room) = state.rooms.get_mut(&room_id) else {
            return Departure::Absent;
        };
        if !room.remove_session(user_id, token) {
            let departure = if room.contains(user_id) {
                Departure::Replaced
            } else {
                Departure::Absent
            };
            debug!(
                "Subscription {} of user {} in room {} already gone ({:?})",
                token, user_id, room_id, departure
            );
            return departure;
        }

        let username = state
            .users
            .get(user_id)
            .map(|user| user.username.clone())
            .unwrap_or_default();
        let notice = ChatMessage::system(
            self.ids.messages.next(),
            room_id,
            format!("{} has left the room", username),
        );
        self.fan_out(&state.users, room, &notice);

        info!("User {} disconnected from room {}", user_id, room_id);
        Departure::Removed
    }

    /// Leave a room explicitly
    ///
    /// Not being a member is a reported outcome, not an error.
    pub async fn leave_room(&self, user_id: UserId, room_id: RoomId) -> Result<Outcome, ChatError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let username = state.user(user_id)?.username.clone();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ChatError::NotFound("room not found".to_string()))?;

        if !room.remove_member(user_id) {
            return Ok(Outcome::refused("user is not in the room"));
        }

        let notice = ChatMessage::system(
            self.ids.messages.next(),
            room_id,
            format!("{} has left the room", username),
        );
        self.fan_out(&state.users, room, &notice);

        info!("User {} left room {}", user_id, room_id);
        Ok(Outcome::ok("left room successfully"))
    }

    /// Broadcast a user's message to every member of a room, sender included
    pub async fn send_message(
        &self,
        user_id: UserId,
        room_id: RoomId,
        content: String,
    ) -> Result<Receipt, ChatError> {
        if content.is_empty() {
            return Err(ChatError::InvalidArgument("message cannot be empty".to_string()));
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let username = state.user(user_id)?.username.clone();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ChatError::NotFound("room not found".to_string()))?;
        if !room.contains(user_id) {
            return Err(ChatError::PermissionDenied("user is not in the room".to_string()));
        }

        let msg = ChatMessage::broadcast(self.ids.messages.next(), room_id, &username, content);
        let delivered = self.fan_out(&state.users, room, &msg);
        debug!(
            "Message {} from user {} delivered to {} member(s) of room {}",
            msg.id, user_id, delivered, room_id
        );

        state.users.touch(user_id);
        Ok(Receipt::sent(msg.timestamp))
    }

    /// Deliver a message to every subscription the recipient holds
    pub async fn send_direct_message(
        &self,
        sender_id: UserId,
        recipient_username: &str,
        content: String,
    ) -> Result<Receipt, ChatError> {
        if content.is_empty() {
            return Err(ChatError::InvalidArgument("message cannot be empty".to_string()));
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let sender = state
            .users
            .get(sender_id)
            .ok_or_else(|| ChatError::NotFound("sender not found".to_string()))?
            .username
            .clone();
        let recipient_id = state
            .users
            .find_by_name(recipient_username)
            .ok_or_else(|| ChatError::NotFound("recipient not found".to_string()))?
            .id;

        if !state.rooms.values().any(|room| room.contains(recipient_id)) {
            return Err(ChatError::Unavailable(
                "recipient is not connected to any room".to_string(),
            ));
        }

        let msg = ChatMessage::direct(self.ids.messages.next(), &sender, content);
        let mut delivered = 0;
        for room in state.rooms.values_mut() {
            if let Some(fanout) = room.deliver_to(recipient_id, &msg) {
                delivered += fanout.delivered;
                self.announce_evicted(&state.users, room, fanout.evicted);
            }
        }
        debug!(
            "Direct message {} from user {} to user {} delivered on {} subscription(s)",
            msg.id, sender_id, recipient_id, delivered
        );

        state.users.touch(sender_id);
        Ok(Receipt::sent(msg.timestamp))
    }

    /// Rename a user and announce it in every room they belong to
    ///
    /// The directory update and all announcements happen in one write
    /// section.
    pub async fn change_username(&self, user_id: UserId, new_username: &str) -> Result<Outcome, ChatError> {
        if new_username.is_empty() {
            return Err(ChatError::InvalidArgument("new username cannot be empty".to_string()));
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let old = match state.users.rename(user_id, new_username) {
            RenameOutcome::Renamed { old } => old,
            RenameOutcome::Unchanged => return Ok(Outcome::ok("username unchanged")),
            RenameOutcome::Taken => return Ok(Outcome::refused("username already taken")),
            RenameOutcome::UnknownUser => return Ok(Outcome::refused("user not found")),
        };

        let mut room_ids: Vec<_> = state
            .rooms
            .values()
            .filter(|room| room.contains(user_id))
            .map(|room| room.id)
            .collect();
        room_ids.sort();
        for room_id in room_ids {
            let Some(room) = state.rooms.get_mut(&room_id) else {
                continue;
            };
            let notice = ChatMessage::system(
                self.ids.messages.next(),
                room_id,
                format!("{} changed their username to {}", old, new_username),
            );
            self.fan_out(&state.users, room, &notice);
        }

        info!("User {} renamed from '{}' to '{}'", user_id, old, new_username);
        Ok(Outcome::ok("username changed successfully"))
    }

    /// Members of a room with their current display names, ordered by id
    pub async fn list_users(&self, room_id: RoomId) -> Result<Vec<UserInfo>, ChatError> {
        let state = self.state.read().await;
        let room = state.room(room_id)?;

        let mut users: Vec<_> = room
            .member_ids()
            .filter_map(|id| state.users.get(id))
            .map(|user| UserInfo {
                user_id: user.id,
                username: user.username.clone(),
                last_active: user.last_active,
            })
            .collect();
        users.sort_by_key(|user| user.user_id);
        Ok(users)
    }

    /// Deliver to every member of `room`, then announce the departure of
    /// anyone evicted for falling behind. Returns the number of handles
    /// that accepted `msg`.
    fn fan_out(&self, users: &UserDirectory, room: &mut Room, msg: &ChatMessage) -> usize {
        let fanout = room.broadcast(msg);
        self.announce_evicted(users, room, fanout.evicted);
        fanout.delivered
    }

    fn announce_evicted(&self, users: &UserDirectory, room: &mut Room, mut evicted: Vec<UserId>) {
        // Each round removes members, so this ends
        while let Some(user_id) = evicted.pop() {
            let username = users
                .get(user_id)
                .map(|user| user.username.as_str())
                .unwrap_or_default();
            let notice = ChatMessage::system(
                self.ids.messages.next(),
                room.id,
                format!("{} has left the room", username),
            );
            evicted.extend(room.broadcast(&notice).evicted);
            info!("User {} dropped from room {} after falling behind", user_id, room.id);
        }
    }
}
