use crate::net::framing::Payload;
use crate::relay::{ClientHandle, Relay};

/// Something that happened on the relay, queued by the event loop and handed
/// to the [`RelayHandler`] once the current batch of socket events has been read.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connection(ClientHandle),
    Message(ClientHandle, Payload),
    Disconnection(ClientHandle),
}

impl RelayEvent {
    pub fn dispatch<H: RelayHandler + ?Sized>(self, handler: &mut H, relay: &mut Relay) {
        match self {
            RelayEvent::Connection(client) => handler.on_connection(relay, &client),
            RelayEvent::Message(client, message) => handler.on_message(relay, &client, message),
            RelayEvent::Disconnection(client) => handler.on_disconnection(relay, &client),
        }
    }
}

/// Observer of relay events. Every callback gets the registry so it can reply,
/// broadcast or disconnect clients. On disconnection the client is already gone
/// from the registry.
pub trait RelayHandler {
    fn on_connection(&mut self, _relay: &mut Relay, _client: &ClientHandle) {}

    fn on_message(&mut self, _relay: &mut Relay, _client: &ClientHandle, _message: Payload) {}

    fn on_disconnection(&mut self, _relay: &mut Relay, _client: &ClientHandle) {}
}

/// Collects events instead of reacting to them.
impl RelayHandler for Vec<RelayEvent> {
    fn on_connection(&mut self, _relay: &mut Relay, client: &ClientHandle) {
        self.push(RelayEvent::Connection(client.clone()));
    }

    fn on_message(&mut self, _relay: &mut Relay, client: &ClientHandle, message: Payload) {
        self.push(RelayEvent::Message(client.clone(), message));
    }

    fn on_disconnection(&mut self, _relay: &mut Relay, client: &ClientHandle) {
        self.push(RelayEvent::Disconnection(client.clone()));
    }
}
