//! Connection relay: accepts sockets, runs the handshake, decodes frames and
//! keeps the registry of connected clients.

mod client;
mod command;
mod event;
mod registry;
mod server;

pub use client::{ClientHandle, ClientId};
pub use command::{Command, CommandSender};
pub use event::{RelayEvent, RelayHandler};
pub use registry::Relay;
pub use server::RelayServer;
