//! Live delivery handle
//!
//! The capability through which the registry pushes messages to one
//! connected (user, room) subscription.

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::ChatMessage;
use crate::types::SessionToken;

/// Sending half of one subscription's bounded delivery queue
///
/// Pushing never waits: the registry enqueues while holding its lock and a
/// separate task drains the queue to the socket. A full or closed queue is
/// reported to the caller, which logs and skips that recipient.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    token: SessionToken,
    sender: mpsc::Sender<ChatMessage>,
}

impl DeliveryHandle {
    /// Create a handle for the subscription identified by `token`
    pub fn new(token: SessionToken, sender: mpsc::Sender<ChatMessage>) -> Self {
        Self { token, sender }
    }

    /// Subscription this handle belongs to
    pub fn token(&self) -> SessionToken {
        self.token
    }

    /// Queue a message for this subscription
    pub fn deliver(&self, msg: &ChatMessage) -> Result<(), SendError> {
        self.sender.try_send(msg.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
