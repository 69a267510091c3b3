//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake,
//! request parsing and dispatch to the registry, and the subscription
//! tasks that stream room messages back to the client.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, ChatError};
use crate::message::{ChatMessage, ClientMessage, ErrorCode, ServerMessage};
use crate::registry::{ChatRegistry, Departure};
use crate::session::Session;
use crate::types::ConnectionId;

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle. Every subscription opened on the
/// connection ends when the connection does.
pub async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ChatRegistry>,
    config: Arc<Config>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = ConnectionId::new();
    info!("Connection {} established from {}", connection_id, peer_addr);

    // Send connection success message
    let connected_msg = ServerMessage::Connected {
        connection_id: connection_id.to_string(),
    };
    let json = serde_json::to_string(&connected_msg)?;
    ws_sender.send(Message::Text(json.into())).await?;

    // Channel for replies and subscription events -> client
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(config.outbound_buffer);

    let dispatcher = Dispatcher {
        registry,
        out: out_tx,
        delivery_queue: config.delivery_queue,
        connection_id,
    };

    // Spawn read task (WebSocket -> registry)
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(request) => {
                        if dispatcher.dispatch(request).await.is_err() {
                            debug!("Outbound channel closed, ending read task for {}", connection_id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid JSON from {}: {}", connection_id, e);
                        let reply = ServerMessage::Error {
                            code: ErrorCode::InvalidMessage,
                            message: format!("Invalid message format: {}", e),
                        };
                        if dispatcher.reply(reply).await.is_err() {
                            break;
                        }
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Ping from {}", connection_id);
                }
                Ok(Message::Pong(_)) => {
                    debug!("Pong from {}", connection_id);
                }
                Ok(_) => {
                    // Binary or other message types - ignore
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", connection_id);
    });

    // Spawn write task (ServerMessage -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    // Continue - don't break on serialization errors
                }
            }
        }
        debug!("Write task ended for {}", connection_id);

        // Send close frame when done
        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", connection_id);
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", connection_id);
        }
    }

    // Dropping the outbound receiver is the termination signal every
    // subscription on this connection waits for
    read_task.abort();
    write_task.abort();

    info!("Connection {} closed", connection_id);

    Ok(())
}

/// Routes one connection's requests to the registry
struct Dispatcher {
    registry: Arc<ChatRegistry>,
    out: mpsc::Sender<ServerMessage>,
    delivery_queue: usize,
    connection_id: ConnectionId,
}

/// What a served request hands back to the connection
enum Reply {
    /// A single response frame
    Frame(ServerMessage),
    /// An admitted subscription, announced before its stream starts
    Subscription(Session, mpsc::Receiver<ChatMessage>),
}

impl Dispatcher {
    /// Serve one request
    ///
    /// Request failures become error frames; only a closed outbound channel
    /// is returned as an error.
    async fn dispatch(&self, request: ClientMessage) -> Result<(), AppError> {
        debug!("Connection {} request: {}", self.connection_id, request.kind());

        match self.call(request).await {
            Ok(Reply::Frame(msg)) => self.reply(msg).await,
            Ok(Reply::Subscription(session, rx)) => self.subscribe(session, rx).await,
            Err(e) => self.reply(e.into()).await,
        }
    }

    async fn reply(&self, msg: ServerMessage) -> Result<(), AppError> {
        self.out.send(msg).await.map_err(|_| AppError::ChannelSend)
    }

    async fn call(&self, request: ClientMessage) -> Result<Reply, ChatError> {
        let registry = &self.registry;
        let reply = match request {
            ClientMessage::CreateUser { username, password } => {
                let account = registry.create_user(username, password).await?;
                ServerMessage::Authenticated {
                    user_id: account.user_id,
                    username: account.username,
                }
            }
            ClientMessage::LoginUser { username, password } => {
                let account = registry.login_user(&username, password).await?;
                ServerMessage::Authenticated {
                    user_id: account.user_id,
                    username: account.username,
                }
            }
            ClientMessage::CreateRoom { name } => {
                let room_id = registry.create_room(&name).await?;
                ServerMessage::RoomCreated { room_id, name }
            }
            ClientMessage::GetRoomInfo { room_id } => {
                ServerMessage::RoomInfo(registry.get_room_info(room_id).await?)
            }
            ClientMessage::ListRooms => ServerMessage::RoomList {
                rooms: registry.list_rooms().await,
            },
            ClientMessage::JoinRoom { user_id, room_id } => {
                let (session, rx) =
                    Session::admit(Arc::clone(registry), user_id, room_id, self.delivery_queue).await?;
                return Ok(Reply::Subscription(session, rx));
            }
            ClientMessage::LeaveRoom { user_id, room_id } => {
                let outcome = registry.leave_room(user_id, room_id).await?;
                ServerMessage::LeftRoom {
                    room_id,
                    success: outcome.success,
                    message: outcome.message,
                }
            }
            ClientMessage::SendMessage {
                user_id,
                room_id,
                content,
            } => {
                let receipt = registry.send_message(user_id, room_id, content).await?;
                ServerMessage::Sent {
                    status: receipt.status,
                    timestamp: receipt.timestamp,
                }
            }
            ClientMessage::SendDirectMessage {
                sender_id,
                recipient_username,
                content,
            } => {
                let receipt = registry
                    .send_direct_message(sender_id, &recipient_username, content)
                    .await?;
                ServerMessage::Sent {
                    status: receipt.status,
                    timestamp: receipt.timestamp,
                }
            }
            ClientMessage::ChangeUsername {
                user_id,
                new_username,
            } => {
                let outcome = registry.change_username(user_id, &new_username).await?;
                ServerMessage::UsernameChanged {
                    success: outcome.success,
                    message: outcome.message,
                }
            }
            ClientMessage::ListUsers { room_id } => ServerMessage::UserList {
                room_id,
                users: registry.list_users(room_id).await?,
            },
        };
        Ok(Reply::Frame(reply))
    }

    /// Confirm the subscription, then hand it to its own task
    async fn subscribe(&self, session: Session, rx: mpsc::Receiver<ChatMessage>) -> Result<(), AppError> {
        let room_id = session.room_id();
        self.reply(ServerMessage::Subscribed { room_id }).await?;
        debug!(
            "Connection {} opened subscription {} to room {}",
            self.connection_id,
            session.token(),
            room_id
        );

        tokio::spawn(run_subscription(session, rx, self.out.clone()));
        Ok(())
    }
}

/// Forward a subscription's queue to the connection until either side ends
///
/// Runs outside the registry lock. The queue ends when an explicit leave,
/// an eviction or a newer join drops the handle; the connection ends when
/// its write task stops. A subscription superseded by a newer join of the
/// same user ends silently, since the room is still streaming to them.
async fn run_subscription(
    session: Session,
    mut rx: mpsc::Receiver<ChatMessage>,
    out: mpsc::Sender<ServerMessage>,
) {
    let room_id = session.room_id();
    let forward_out = out.clone();

    let departure = session
        .run_until(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if forward_out.send(ServerMessage::Message(msg)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = forward_out.closed() => break,
                }
            }
        })
        .await;

    if departure != Departure::Replaced {
        let _ = out.send(ServerMessage::Unsubscribed { room_id }).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::tests::{registry, user};
    use crate::types::RoomId;

    fn dispatcher(registry: Arc<ChatRegistry>) -> (Dispatcher, mpsc::Receiver<ServerMessage>) {
        let (out, rx) = mpsc::channel(32);
        let dispatcher = Dispatcher {
            registry,
            out,
            delivery_queue: 8,
            connection_id: ConnectionId::new(),
        };
        (dispatcher, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    #[tokio::test]
    async fn test_unary_errors_become_frames() {
        let (dispatcher, mut rx) = dispatcher(registry());

        dispatcher
            .dispatch(ClientMessage::GetRoomInfo { room_id: RoomId(1) })
            .await
            .unwrap();

        match next(&mut rx).await {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotFound);
                assert_eq!(message, "room not found");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_streams_messages() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;
        let (dispatcher, mut rx) = dispatcher(Arc::clone(&registry));

        dispatcher
            .dispatch(ClientMessage::JoinRoom { user_id: a, room_id: room })
            .await
            .unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::Subscribed { room_id } if room_id == room));
        match next(&mut rx).await {
            ServerMessage::Message(msg) => assert_eq!(msg.content, "A has joined the room"),
            other => panic!("unexpected frame: {:?}", other),
        }

        dispatcher
            .dispatch(ClientMessage::SendMessage {
                user_id: a,
                room_id: room,
                content: "hi".to_string(),
            })
            .await
            .unwrap();

        // The reply and the broadcast travel different paths; accept either order
        let frames = [next(&mut rx).await, next(&mut rx).await];
        assert!(frames.iter().any(|f| matches!(f, ServerMessage::Sent { .. })));
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::Message(m) if m.content == "hi")));
    }

    #[tokio::test]
    async fn test_leave_ends_subscription() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;
        let (dispatcher, mut rx) = dispatcher(Arc::clone(&registry));

        dispatcher
            .dispatch(ClientMessage::JoinRoom { user_id: a, room_id: room })
            .await
            .unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        dispatcher
            .dispatch(ClientMessage::LeaveRoom { user_id: a, room_id: room })
            .await
            .unwrap();

        let frames = [next(&mut rx).await, next(&mut rx).await];
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::LeftRoom { success: true, .. })));
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::Unsubscribed { room_id } if *room_id == room)));
        assert!(registry.members(room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_leaves_rooms() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;
        let b = user(&registry, "B").await;
        let (watcher, mut watcher_rx) = dispatcher(Arc::clone(&registry));
        let (leaver, leaver_rx) = dispatcher(Arc::clone(&registry));

        watcher
            .dispatch(ClientMessage::JoinRoom { user_id: a, room_id: room })
            .await
            .unwrap();
        leaver
            .dispatch(ClientMessage::JoinRoom { user_id: b, room_id: room })
            .await
            .unwrap();

        // The leaver's socket goes away
        drop(leaver_rx);

        let mut saw_leave = false;
        for _ in 0..4 {
            if let ServerMessage::Message(msg) = next(&mut watcher_rx).await {
                if msg.content == "B has left the room" {
                    saw_leave = true;
                    break;
                }
            }
        }
        assert!(saw_leave);
        assert_eq!(registry.members(room).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_rejoin_keeps_subscription_open() {
        let registry = registry();
        let room = registry.create_room("general").await.unwrap();
        let a = user(&registry, "A").await;
        let (dispatcher, mut rx) = dispatcher(Arc::clone(&registry));

        for _ in 0..2 {
            dispatcher
                .dispatch(ClientMessage::JoinRoom { user_id: a, room_id: room })
                .await
                .unwrap();
        }

        // Two confirmations and two join notices, and nothing that says
        // the room stopped streaming
        let mut subscribed = 0;
        for _ in 0..4 {
            match next(&mut rx).await {
                ServerMessage::Subscribed { .. } => subscribed += 1,
                ServerMessage::Message(msg) => assert_eq!(msg.content, "A has joined the room"),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(subscribed, 2);
        assert_eq!(registry.members(room).await.unwrap(), vec![a]);

        dispatcher
            .dispatch(ClientMessage::SendMessage {
                user_id: a,
                room_id: room,
                content: "still here".to_string(),
            })
            .await
            .unwrap();

        let frames = [next(&mut rx).await, next(&mut rx).await];
        assert!(frames.iter().any(|f| matches!(f, ServerMessage::Sent { .. })));
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerMessage::Message(m) if m.content == "still here")));

        // Only one copy arrives and the replaced stream stayed quiet
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
