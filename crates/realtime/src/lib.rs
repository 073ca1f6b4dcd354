//! Realtime pub/sub connection
//!
//! One `ConnectionManager` owns one broker connection (STOMP over WebSocket)
//! and keeps it alive with bounded exponential backoff. Features subscribe to
//! topics through it and receive decoded messages via callbacks.
//!
//! Lifecycle:
//! 1. `connect()` opens a transport through the `Connector`
//! 2. On handshake: status Connected, attempt reset, `on_connected` hooks run
//! 3. On failure or transport loss: one retry timer, delay doubling up to a cap
//! 4. After `max_attempts` consecutive failures: give up until `connect()`
//! 5. `disconnect()` unsubscribes everything and closes the transport

pub mod chat;
pub mod connection;
pub mod error;
pub mod frame;
pub mod notifications;
pub mod registry;
pub mod transport;

pub use chat::ChatRooms;
pub use connection::{
    ConnectedHook, ConnectionAction, ConnectionEvent, ConnectionManager, ConnectionState,
    ConnectionStatus, HookId, ReconnectPolicy, handle_event,
};
pub use error::{Error, Result};
pub use frame::{Command, Frame};
pub use notifications::UserNotifications;
pub use registry::{ListenerId, Message, MessageHandler, SubscriptionRegistry};
pub use transport::{
    ConnectFuture, Connector, HeaderFuture, HeaderSource, TransportEvent, TransportSession,
    WebSocketConnector,
};
