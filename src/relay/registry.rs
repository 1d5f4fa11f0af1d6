use std::collections::HashMap;

use log::{debug, warn};
use mio::Token;
use serde::Serialize;

use crate::error::{RelayError, Result};
use crate::messages::ServerMessage;
use crate::net::framing::encode_text_frame_into;
use crate::relay::{ClientHandle, ClientId};

/// Registry-side state of one open connection: its poll token and the bytes
/// queued for it that the event loop has not flushed yet.
#[derive(Debug)]
pub(crate) struct Peer {
    pub(crate) token: Token,
    pub(crate) outbox: Vec<u8>,
}

/// The client registry. Maps each connected client id to its connection and
/// owns every outbound byte. Sends only queue frames; the event loop writes
/// them to the sockets once the current batch of events has been handled.
#[derive(Debug, Default)]
pub struct Relay {
    clients: HashMap<ClientId, Peer>,
    /// Clients removed by `disconnect_client`, waiting for a final flush and close.
    evicted: Vec<(ClientId, Peer)>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client whose outbound queue starts with `preamble` (the handshake response).
    pub(crate) fn register(&mut self, id: ClientId, token: Token, preamble: Vec<u8>) -> ClientHandle {
        let peer = Peer {
            token,
            outbox: preamble,
        };
        self.clients.insert(id.clone(), peer);
        ClientHandle::new(id)
    }

    /// Drops a client whose transport closed or failed.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Peer> {
        self.clients.remove(id)
    }

    pub(crate) fn take_evicted(&mut self) -> Vec<(ClientId, Peer)> {
        std::mem::take(&mut self.evicted)
    }

    pub(crate) fn peers_mut(&mut self) -> impl Iterator<Item = (&ClientId, &mut Peer)> {
        self.clients.iter_mut()
    }

    /// Serializes `data` as JSON and queues it as a text frame for one client.
    pub fn send<T: Serialize + ?Sized>(&mut self, id: &str, data: &T) -> Result<()> {
        let Some(peer) = self.clients.get_mut(id) else {
            warn!("dropping message for {id}: client is not connected");
            return Err(RelayError::UnknownClient(ClientId::from(id)));
        };
        let json = simd_json::to_vec(data)?;
        encode_text_frame_into(&json, &mut peer.outbox);
        Ok(())
    }

    /// Queues `data` for every client except `except`. Returns how many clients it was queued for.
    pub fn broadcast<T: Serialize + ?Sized>(&mut self, data: &T, except: Option<&str>) -> Result<usize> {
        let json = simd_json::to_vec(data)?;
        let mut delivered = 0;
        for (id, peer) in &mut self.clients {
            if except == Some(id.as_str()) {
                continue;
            }
            encode_text_frame_into(&json, &mut peer.outbox);
            delivered += 1;
        }
        debug!("broadcast {} bytes to {delivered} clients", json.len());
        Ok(delivered)
    }

    pub fn get_client(&self, id: &str) -> Option<ClientHandle> {
        self.clients
            .get_key_value(id)
            .map(|(id, _)| ClientHandle::new(id.clone()))
    }

    /// Snapshot of the connected ids. Order is unspecified.
    pub fn list_clients(&self) -> Vec<ClientId> {
        self.clients.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Sends `{type: "disconnect", reason}` and removes the client at once; the event
    /// loop flushes that last frame, closes the socket and emits the disconnection.
    /// Returns false if no such client is connected.
    pub fn disconnect_client(&mut self, id: &str, reason: &str) -> bool {
        if let Err(e) = self.send(id, &ServerMessage::Disconnect { reason }) {
            debug!("disconnect of {id} skipped: {e}");
            return false;
        }
        match self.clients.remove_entry(id) {
            Some(entry) => {
                self.evicted.push(entry);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_output(&self, id: &str) -> Option<&[u8]> {
        self.clients
            .get(id)
            .or_else(|| self.evicted.iter().find(|(evicted, _)| evicted.as_str() == id).map(|(_, peer)| peer))
            .map(|peer| peer.outbox.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::{decode_frame, Decoded, Payload};
    use simd_json::prelude::*;

    fn relay_with(ids: &[&str]) -> Relay {
        let mut relay = Relay::new();
        for (n, id) in ids.iter().enumerate() {
            relay.register(ClientId::from(*id), Token(n + 2), Vec::new());
        }
        relay
    }

    /// Decodes every frame queued for `id`.
    fn queued(relay: &Relay, id: &str) -> Vec<Payload> {
        let mut buf = relay.pending_output(id).unwrap_or_default();
        let mut out = Vec::new();
        while let Decoded::Message { payload, remainder } = decode_frame(buf) {
            out.push(payload);
            buf = remainder;
        }
        assert!(buf.is_empty(), "trailing bytes in outbox");
        out
    }

    #[test]
    fn send_queues_json_text_frame() {
        let mut relay = relay_with(&["a"]);
        relay.send("a", &ServerMessage::Announcement { message: "hi" }).unwrap();

        let frames = queued(&relay, "a");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].str_field("type"), Some("announcement"));
        assert_eq!(frames[0].str_field("message"), Some("hi"));
    }

    #[test]
    fn send_to_unknown_client_errors() {
        let mut relay = relay_with(&["a"]);
        let err = relay.send("ghost", &"x").unwrap_err();
        assert!(matches!(err, RelayError::UnknownClient(id) if id.as_str() == "ghost"));
        assert!(queued(&relay, "a").is_empty());
    }

    #[test]
    fn broadcast_to_empty_registry_writes_nothing() {
        let mut relay = Relay::new();
        assert_eq!(relay.broadcast(&"hello", None).unwrap(), 0);
    }

    #[test]
    fn broadcast_skips_excluded_client() {
        let mut relay = relay_with(&["a", "b", "c"]);
        let delivered = relay.broadcast(&"hello", Some("b")).unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(queued(&relay, "a").len(), 1);
        assert_eq!(queued(&relay, "b").len(), 0);
        assert_eq!(queued(&relay, "c").len(), 1);
    }

    #[test]
    fn broadcast_without_exclusion_reaches_everyone_once() {
        let mut relay = relay_with(&["a", "b", "c"]);
        assert_eq!(relay.broadcast(&"hello", None).unwrap(), 3);
        for id in ["a", "b", "c"] {
            assert_eq!(queued(&relay, id), vec![Payload::Json("hello".into())]);
        }
    }

    #[test]
    fn get_and_list_clients() {
        let relay = relay_with(&["a", "b"]);
        assert_eq!(relay.get_client("a").map(|h| h.id().clone()), Some(ClientId::from("a")));
        assert!(relay.get_client("zzz").is_none());

        let mut ids = relay.list_clients();
        ids.sort();
        assert_eq!(ids, vec![ClientId::from("a"), ClientId::from("b")]);
    }

    #[test]
    fn disconnect_client_sends_reason_then_removes() {
        let mut relay = relay_with(&["a", "b"]);
        assert!(relay.disconnect_client("a", "bye"));

        assert!(relay.get_client("a").is_none());
        assert_eq!(relay.len(), 1);

        let frames = queued(&relay, "a");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].str_field("type"), Some("disconnect"));
        assert_eq!(frames[0].str_field("reason"), Some("bye"));

        let evicted = relay.take_evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0.as_str(), "a");
    }

    #[test]
    fn disconnect_unknown_client_returns_false() {
        let mut relay = relay_with(&["a"]);
        assert!(!relay.disconnect_client("ghost", "bye"));
        assert!(relay.take_evicted().is_empty());
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn handle_stops_working_after_removal() {
        let mut relay = relay_with(&["a"]);
        let handle = relay.get_client("a").unwrap();
        assert!(handle.is_connected(&relay));

        relay.remove("a");
        assert!(!handle.is_connected(&relay));
        assert!(handle.send(&mut relay, &"late").is_err());
    }

    #[test]
    fn registered_preamble_precedes_frames() {
        let mut relay = Relay::new();
        relay.register(ClientId::from("a"), Token(2), b"HTTP/1.1 101\r\n\r\n".to_vec());
        relay.send("a", &"x").unwrap();

        let out = relay.pending_output("a").unwrap();
        assert!(out.starts_with(b"HTTP/1.1 101\r\n\r\n"));
        assert_eq!(out.len(), 16 + 2 + 3);
    }

    #[test]
    fn json_value_round_trips_through_broadcast() {
        let mut relay = relay_with(&["a"]);
        let value = simd_json::json!({"type": "message", "n": 3});
        relay.broadcast(&value, None).unwrap();

        let frames = queued(&relay, "a");
        let json = frames[0].as_json().unwrap();
        assert_eq!(json.get("n").and_then(|n| n.as_u64()), Some(3));
    }
}
