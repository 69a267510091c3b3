//! JoinRoom subscription lifecycle
//!
//! A subscription moves through `Admitting -> Subscribed -> Leaving -> Closed`.
//! Admission and departure each take the registry's write lock once; while
//! subscribed, the session holds no lock and just waits for its stream to end.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::delivery::DeliveryHandle;
use crate::error::ChatError;
use crate::message::ChatMessage;
use crate::registry::{ChatRegistry, Departure};
use crate::types::{RoomId, SessionToken, UserId};

/// Lifecycle state of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Admitting,
    Subscribed,
    Leaving,
    Closed,
}

/// One user's subscription to one room
pub struct Session {
    registry: Arc<ChatRegistry>,
    user_id: UserId,
    room_id: RoomId,
    token: SessionToken,
    state: SessionState,
}

impl Session {
    /// Admit `user_id` into `room_id`
    ///
    /// On success the session is `Subscribed` and the returned receiver is
    /// the subscription's delivery queue, holding at most `queue_capacity`
    /// undelivered messages. The join notice is already queued on it.
    pub async fn admit(
        registry: Arc<ChatRegistry>,
        user_id: UserId,
        room_id: RoomId,
        queue_capacity: usize,
    ) -> Result<(Session, mpsc::Receiver<ChatMessage>), ChatError> {
        let token = registry.next_session_token();
        let mut session = Session {
            registry,
            user_id,
            room_id,
            token,
            state: SessionState::Admitting,
        };

        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = DeliveryHandle::new(token, tx);
        if let Err(e) = session.registry.admit(user_id, room_id, handle).await {
            session.state = SessionState::Closed;
            return Err(e);
        }

        session.state = SessionState::Subscribed;
        debug!(
            "Subscription {} open for user {} in room {}",
            token, user_id, room_id
        );
        Ok((session, rx))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    /// Stay subscribed until `terminated` resolves, then leave
    ///
    /// `terminated` is the stream's end: the client went away, or the
    /// delivery queue was closed by an explicit leave, an eviction or a
    /// newer join. The session is `Closed` afterwards; the returned
    /// [`Departure`] tells the caller whether the user is still in the
    /// room through a newer subscription.
    pub async fn run_until<F>(mut self, terminated: F) -> Departure
    where
        F: Future<Output = ()>,
    {
        terminated.await;
        self.leave().await
    }

    async fn leave(&mut self) -> Departure {
        if self.state != SessionState::Subscribed {
            return Departure::Absent;
        }
        self.state = SessionState::Leaving;
        let departure = self
            .registry
            .depart(self.user_id, self.room_id, self.token)
            .await;
        debug!(
            "Subscription {} closed for user {} in room {} ({:?})",
            self.token, self.user_id, self.room_id, departure
        );
        self.state = SessionState::Closed;
        departure
    }
}

impl Drop for Session {
    // A session dropped mid-flight (its task was aborted) still owes the
    // room its departure.
    fn drop(&mut self) {
        if !matches!(self.state, SessionState::Subscribed | SessionState::Leaving) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let (user_id, room_id, token) = (self.user_id, self.room_id, self.token);
        runtime.spawn(async move {
            registry.depart(user_id, room_id, token).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::registry::tests::{registry, user};

    async fn next(rx: &mut mpsc::Receiver<ChatMessage>) -> ChatMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("delivery queue closed")
    }

    #[tokio::test]
    async fn test_admit_queues_own_join_notice() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;

        let (session, mut rx) = Session::admit(Arc::clone(&registry), a, room, 8)
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Subscribed);
        assert_eq!(session.room_id(), room);
        let notice = next(&mut rx).await;
        assert!(notice.is_system);
        assert_eq!(notice.content, "A has joined the room");
        assert_eq!(registry.members(room).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_admit_unknown_room() {
        let registry = registry();
        let a = user(&registry, "A").await;

        let err = Session::admit(Arc::clone(&registry), a, RoomId(5), 8)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stream_end_removes_member() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;
        let b = user(&registry, "B").await;

        let (_session_a, mut rx_a) = Session::admit(Arc::clone(&registry), a, room, 8)
            .await
            .unwrap();
        let (session_b, _rx_b) = Session::admit(Arc::clone(&registry), b, room, 8)
            .await
            .unwrap();
        next(&mut rx_a).await;
        assert_eq!(next(&mut rx_a).await.content, "B has joined the room");

        let (disconnect, disconnected) = oneshot::channel::<()>();
        let task = tokio::spawn(session_b.run_until(async {
            let _ = disconnected.await;
        }));

        // Still subscribed while the stream is open
        tokio::task::yield_now().await;
        assert_eq!(registry.members(room).await.unwrap().len(), 2);

        drop(disconnect);
        assert_eq!(task.await.unwrap(), Departure::Removed);

        assert_eq!(next(&mut rx_a).await.content, "B has left the room");
        assert_eq!(registry.members(room).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_leave_and_disconnect_race_removes_once() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;
        let b = user(&registry, "B").await;

        let (_session_a, mut rx_a) = Session::admit(Arc::clone(&registry), a, room, 8)
            .await
            .unwrap();
        let (session_b, _rx_b) = Session::admit(Arc::clone(&registry), b, room, 8)
            .await
            .unwrap();
        next(&mut rx_a).await;
        next(&mut rx_a).await;

        let explicit = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.leave_room(b, room).await })
        };
        let implicit = tokio::spawn(session_b.run_until(async {}));

        explicit.await.unwrap().unwrap();
        let departure = implicit.await.unwrap();
        assert!(matches!(departure, Departure::Removed | Departure::Absent));

        // Whichever path won, exactly one departure notice went out
        let leaves: Vec<_> = std::iter::from_fn(|| rx_a.try_recv().ok())
            .filter(|m| m.content == "B has left the room")
            .collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(registry.members(room).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_stale_subscription_keeps_replacement() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;

        let (first, _rx1) = Session::admit(Arc::clone(&registry), a, room, 8)
            .await
            .unwrap();
        let (second, mut rx2) = Session::admit(Arc::clone(&registry), a, room, 8)
            .await
            .unwrap();
        assert_ne!(first.token(), second.token());
        next(&mut rx2).await;

        // The replaced subscription ends; the user stays in the room
        assert_eq!(first.run_until(async {}).await, Departure::Replaced);
        assert_eq!(registry.members(room).await.unwrap(), vec![a]);

        registry.send_message(a, room, "still here".to_string()).await.unwrap();
        assert_eq!(next(&mut rx2).await.content, "still here");
    }

    #[tokio::test]
    async fn test_dropped_session_departs() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;

        let (session, _rx) = Session::admit(Arc::clone(&registry), a, room, 8)
            .await
            .unwrap();
        drop(session);

        for _ in 0..50 {
            if registry.members(room).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dropped session was not cleaned up");
    }
}
