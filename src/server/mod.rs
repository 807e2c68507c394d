//! Server side of the chat service
//!
//! - [`chat_server`]: QUIC endpoint and accept loop
//! - [`connection_handler`]: one task per connection, frames in and out
//! - [`hub`]: the coordinator owning all session state
//! - [`sessions`], [`rooms`], [`router`], [`reconnect`]: the coordinator's parts

pub mod chat_server;
pub mod connection_handler;
pub mod hub;
pub mod reconnect;
pub mod rooms;
pub mod router;
pub mod sessions;

pub use chat_server::{ALPN, ChatServer, ServerConfig, ServerStats};
pub use connection_handler::ConnectionHandler;
pub use hub::{CoordinatorConfig, Hub, HubEvent, HubHandle, HubSnapshot};
pub use reconnect::ReconnectionManager;
pub use rooms::RoomDirectory;
pub use router::MessageRouter;
pub use sessions::{Session, SessionRegistry};
