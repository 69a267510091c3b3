//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization, plus the chat message
//! pushed through live delivery handles.

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::{current_timestamp, MessageId, RoomId, UserId};

/// Author name carried by server-generated notices
pub const SYSTEM_AUTHOR: &str = "SYSTEM";

/// Client → Server message
///
/// One variant per RPC. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a new account
    CreateUser { username: String, password: String },
    /// Authenticate an existing account
    LoginUser { username: String, password: String },
    /// Create a new room
    CreateRoom { name: String },
    /// Fetch details of one room
    GetRoomInfo { room_id: RoomId },
    /// List every room
    ListRooms,
    /// Subscribe to a room's message stream
    JoinRoom { user_id: UserId, room_id: RoomId },
    /// Leave a room explicitly
    LeaveRoom { user_id: UserId, room_id: RoomId },
    /// Broadcast to a room
    SendMessage {
        user_id: UserId,
        room_id: RoomId,
        content: String,
    },
    /// Send to one user on every room they are subscribed to
    SendDirectMessage {
        sender_id: UserId,
        recipient_username: String,
        content: String,
    },
    /// Rename an account
    ChangeUsername { user_id: UserId, new_username: String },
    /// List the members of a room
    ListUsers { room_id: RoomId },
}

impl ClientMessage {
    /// Request name for logging; never includes credentials
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateUser { .. } => "create_user",
            ClientMessage::LoginUser { .. } => "login_user",
            ClientMessage::CreateRoom { .. } => "create_room",
            ClientMessage::GetRoomInfo { .. } => "get_room_info",
            ClientMessage::ListRooms => "list_rooms",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::LeaveRoom { .. } => "leave_room",
            ClientMessage::SendMessage { .. } => "send_message",
            ClientMessage::SendDirectMessage { .. } => "send_direct_message",
            ClientMessage::ChangeUsername { .. } => "change_username",
            ClientMessage::ListUsers { .. } => "list_users",
        }
    }
}

/// Server → Client message
///
/// RPC replies, stream events and errors. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected { connection_id: String },
    /// Account created or login succeeded
    Authenticated { user_id: UserId, username: String },
    /// Room created successfully
    RoomCreated { room_id: RoomId, name: String },
    /// Details of one room
    RoomInfo(RoomInfo),
    /// Every room known to the server
    RoomList { rooms: Vec<RoomSummary> },
    /// Subscription to a room is open
    Subscribed { room_id: RoomId },
    /// Subscription to a room has ended
    Unsubscribed { room_id: RoomId },
    /// Outcome of an explicit leave
    LeftRoom {
        room_id: RoomId,
        success: bool,
        message: String,
    },
    /// Broadcast or direct message accepted
    Sent { status: String, timestamp: i64 },
    /// Outcome of a rename
    UsernameChanged { success: bool, message: String },
    /// Members of a room
    UserList { room_id: RoomId, users: Vec<UserInfo> },
    /// Chat message delivered through a subscription
    Message(ChatMessage),
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Room details returned by `get_room_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub name: String,
    pub member_count: usize,
    pub created_at: i64,
}

/// One entry of `list_rooms`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    pub member_count: usize,
}

/// One entry of `list_users`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: UserId,
    pub username: String,
    pub last_active: i64,
}

/// A message pushed to connected clients
///
/// Transient: it exists only while being fanned out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    /// Author's display name at send time, or `SYSTEM`
    pub username: String,
    /// `None` for direct messages
    pub room_id: Option<RoomId>,
    pub content: String,
    pub timestamp: i64,
    pub is_system: bool,
    pub is_direct: bool,
}

impl ChatMessage {
    /// User-authored broadcast to a room
    pub fn broadcast(id: MessageId, room_id: RoomId, username: &str, content: String) -> Self {
        Self {
            id,
            username: username.to_string(),
            room_id: Some(room_id),
            content,
            timestamp: current_timestamp(),
            is_system: false,
            is_direct: false,
        }
    }

    /// User-authored message to a single recipient
    pub fn direct(id: MessageId, username: &str, content: String) -> Self {
        Self {
            id,
            username: username.to_string(),
            room_id: None,
            content,
            timestamp: current_timestamp(),
            is_system: false,
            is_direct: true,
        }
    }

    /// Server-generated notice (join, leave, rename)
    pub fn system(id: MessageId, room_id: RoomId, content: String) -> Self {
        Self {
            id,
            username: SYSTEM_AUTHOR.to_string(),
            room_id: Some(room_id),
            content,
            timestamp: current_timestamp(),
            is_system: true,
            is_direct: false,
        }
    }
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    Internal,
    /// Frame could not be parsed
    InvalidMessage,
}

/// Convert ChatError to ServerMessage for client notification
impl From<ChatError> for ServerMessage {
    fn from(err: ChatError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
