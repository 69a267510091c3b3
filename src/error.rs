//! Error types for the chat server
//!
//! Defines request-level errors, fatal connection errors and
//! per-recipient delivery errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::ErrorCode;

/// Request-level errors
///
/// Returned by registry operations before any state is mutated.
/// Each variant maps to one status code sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Malformed or empty required field
    #[error("{0}")]
    InvalidArgument(String),

    /// Referenced user or room does not exist
    #[error("{0}")]
    NotFound(String),

    /// Name collision on create
    #[error("{0}")]
    AlreadyExists(String),

    /// Action attempted by a non-member
    #[error("{0}")]
    PermissionDenied(String),

    /// Credential mismatch
    #[error("{0}")]
    Unauthenticated(String),

    /// Valid target with no reachable live handle
    #[error("{0}")]
    Unavailable(String),

    /// Unexpected collaborator failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Status code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            ChatError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ChatError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            ChatError::Unavailable(_) => ErrorCode::Unavailable,
            ChatError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Application-level errors
///
/// Fatal for the connection or process that hits them.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid process configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Message send errors
///
/// Occurs when a message cannot be queued on a live delivery handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The recipient's delivery queue is full
    #[error("Delivery queue full")]
    QueueFull,
}
