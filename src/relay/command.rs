use std::sync::Arc;

use mio::Waker;
use rtrb::Producer;

use crate::error::{RelayError, Result};
use crate::relay::ClientId;

/// Requests from outside the event loop thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log the ids of all connected clients.
    ListClients,
    Disconnect { id: ClientId, reason: String },
    /// Broadcast `{type: "announcement", message}` to everyone.
    Announce(String),
    Shutdown,
}

/// Single producer end of the command queue. Each push wakes the poll loop.
pub struct CommandSender {
    producer: Producer<Command>,
    waker: Arc<Waker>,
}

impl CommandSender {
    pub(crate) fn new(producer: Producer<Command>, waker: Arc<Waker>) -> Self {
        Self { producer, waker }
    }

    pub fn send(&mut self, command: Command) -> Result<()> {
        self.producer
            .push(command)
            .map_err(|_| RelayError::CommandQueueFull)?;
        self.waker.wake()?;
        Ok(())
    }
}
