//! Multi-room WebSocket Chat Server Library
//!
//! Clients register or log in, create and join named rooms, and exchange
//! room broadcasts and direct messages in real time.
//!
//! # Features
//! - Account creation and login (Argon2id credentials)
//! - Room creation, lookup and listing
//! - Room subscriptions streamed over the WebSocket
//! - Room broadcasts and cross-room direct messages
//! - Username changes announced to every room the user is in
//! - Disconnection handling
//!
//! # Architecture
//! - `ChatRegistry` owns users, rooms and live delivery handles behind one
//!   readers-writer lock
//! - Each connection has a `handler` task calling the registry directly
//! - Each `join_room` becomes a `Session` task that forwards its bounded
//!   delivery queue to the socket outside the lock
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use room_relay::{handle_connection, ChatRegistry, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let registry = Arc::new(ChatRegistry::default());
//!     let config = Arc::new(Config::default());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, registry.clone(), config.clone()));
//!     }
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod handler;
pub mod ids;
pub mod message;
pub mod registry;
pub mod room;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use credentials::{Argon2Hasher, Credential, CredentialHasher};
pub use delivery::DeliveryHandle;
pub use error::{AppError, ChatError, SendError};
pub use handler::handle_connection;
pub use message::{ChatMessage, ClientMessage, ErrorCode, ServerMessage};
pub use registry::{Account, ChatRegistry, Departure, Outcome, Receipt};
pub use room::{Fanout, Room};
pub use session::{Session, SessionState};
pub use types::{ConnectionId, MessageId, RoomId, SessionToken, UserId};
