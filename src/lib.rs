//! A WebSocket relay built directly on TCP.
//!
//! [`net`] holds the wire protocol (upgrade handshake and frame codec),
//! [`relay`] the mio event loop and client registry, and [`chat`] the chat
//! application that routes broadcast and direct messages between clients.

pub mod chat;
pub mod config;
pub mod console;
pub mod error;
pub mod messages;
pub mod net;
pub mod relay;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use relay::{ClientHandle, ClientId, Relay, RelayEvent, RelayHandler, RelayServer};
