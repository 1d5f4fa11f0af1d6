//! Chat application on top of the relay.
//!
//! * New clients get a `welcome` and everyone else a `presence` (online).
//! * A `direct_message` with a `targetId` goes to that client only, or comes back
//!   to the sender as an `error` when the target is not connected.
//! * Anything else is broadcast to all other clients as `message`.
//! * Leaving clients produce a `presence` (offline) broadcast.

use log::{debug, error, info};
use simd_json::prelude::*;
use simd_json::{OwnedValue, StaticNode};

use crate::messages::{PresenceStatus, ServerMessage};
use crate::net::framing::Payload;
use crate::relay::{ClientHandle, Relay, RelayHandler};

const DIRECT_MESSAGE: &str = "direct_message";

/// Where a `direct_message` asked to go.
#[derive(Debug, PartialEq)]
enum Target<'a> {
    Client(&'a str),
    /// A truthy `targetId` that is not a string, rendered as JSON. No client id matches it.
    Unreachable(String),
}

/// Null, false, zero and the empty string mean "no target".
fn is_falsy(value: &OwnedValue) -> bool {
    match value {
        OwnedValue::Static(StaticNode::Null | StaticNode::Bool(false)) => true,
        OwnedValue::Static(StaticNode::I64(0) | StaticNode::U64(0)) => true,
        OwnedValue::Static(StaticNode::F64(n)) => *n == 0.0,
        OwnedValue::String(s) => s.is_empty(),
        _ => false,
    }
}

fn direct_target(message: &Payload) -> Option<Target<'_>> {
    if message.str_field("type") != Some(DIRECT_MESSAGE) {
        return None;
    }
    let value = message.as_json()?.get("targetId")?;
    if is_falsy(value) {
        return None;
    }
    match value.as_str() {
        Some(id) => Some(Target::Client(id)),
        None => Some(Target::Unreachable(simd_json::to_string(value).unwrap_or_default())),
    }
}

#[derive(Debug, Default)]
pub struct ChatRelay;

impl ChatRelay {
    pub fn new() -> Self {
        Self
    }

    fn route_direct(relay: &mut Relay, sender: &ClientHandle, target: &str, message: &Payload) -> crate::error::Result<()> {
        let Some(recipient) = relay.get_client(target) else {
            return Self::target_not_found(relay, sender, target);
        };

        let payload = message.as_json().and_then(|value| value.get("payload"));
        recipient.send(
            relay,
            &ServerMessage::DirectMessage {
                from: sender.id(),
                payload,
            },
        )?;
        debug!("relayed direct message from {} to {target}", sender.id());
        Ok(())
    }

    fn target_not_found(relay: &mut Relay, sender: &ClientHandle, target: &str) -> crate::error::Result<()> {
        info!("direct message target not found: {target}");
        sender.send(
            relay,
            &ServerMessage::Error {
                message: format!("User {target} not found."),
            },
        )
    }
}

impl RelayHandler for ChatRelay {
    fn on_connection(&mut self, relay: &mut Relay, client: &ClientHandle) {
        info!("client connected: {}", client.id());
        let welcome = ServerMessage::Welcome {
            message: format!("Welcome, your ID is {}", client.id()),
        };
        let presence = ServerMessage::Presence {
            status: PresenceStatus::Online,
            id: client.id(),
        };
        let result = client
            .send(relay, &welcome)
            .and_then(|()| relay.broadcast(&presence, Some(client.id().as_str())));
        if let Err(e) = result {
            error!("greeting {} failed: {e}", client.id());
        }
    }

    fn on_message(&mut self, relay: &mut Relay, client: &ClientHandle, message: Payload) {
        debug!("message from {}: {message:?}", client.id());

        let result = match direct_target(&message) {
            Some(Target::Client(target)) => Self::route_direct(relay, client, target, &message),
            Some(Target::Unreachable(target)) => Self::target_not_found(relay, client, &target),
            None => relay
                .broadcast(
                    &ServerMessage::Message {
                        from: client.id(),
                        payload: &message,
                    },
                    Some(client.id().as_str()),
                )
                .map(|_| ()),
        };
        if let Err(e) = result {
            error!("routing message from {} failed: {e}", client.id());
        }
    }

    fn on_disconnection(&mut self, relay: &mut Relay, client: &ClientHandle) {
        info!("client disconnected: {}", client.id());
        let presence = ServerMessage::Presence {
            status: PresenceStatus::Offline,
            id: client.id(),
        };
        if let Err(e) = relay.broadcast(&presence, None) {
            error!("offline presence for {} failed: {e}", client.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::{decode_frame, Decoded};
    use crate::relay::ClientId;
    use mio::Token;

    fn relay_with(ids: &[&str]) -> Relay {
        let mut relay = Relay::new();
        for (n, id) in ids.iter().enumerate() {
            relay.register(ClientId::from(*id), Token(n + 2), Vec::new());
        }
        relay
    }

    fn inbound(json: &str) -> Payload {
        Payload::from_bytes(json.as_bytes().to_vec())
    }

    fn queued(relay: &Relay, id: &str) -> Vec<Payload> {
        let mut buf = relay.pending_output(id).unwrap_or_default();
        let mut out = Vec::new();
        while let Decoded::Message { payload, remainder } = decode_frame(buf) {
            out.push(payload);
            buf = remainder;
        }
        out
    }

    #[test]
    fn connection_sends_welcome_and_presence() {
        let mut relay = relay_with(&["a", "b"]);
        let handle = relay.get_client("a").unwrap();
        ChatRelay::new().on_connection(&mut relay, &handle);

        let to_a = queued(&relay, "a");
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].str_field("type"), Some("welcome"));
        assert_eq!(to_a[0].str_field("message"), Some("Welcome, your ID is a"));

        let to_b = queued(&relay, "b");
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].str_field("type"), Some("presence"));
        assert_eq!(to_b[0].str_field("status"), Some("online"));
        assert_eq!(to_b[0].str_field("id"), Some("a"));
    }

    #[test]
    fn plain_message_is_broadcast_to_others_with_sender() {
        let mut relay = relay_with(&["a", "b", "c"]);
        let sender = relay.get_client("a").unwrap();
        ChatRelay::new().on_message(&mut relay, &sender, inbound(r#"{"text":"yo"}"#));

        assert!(queued(&relay, "a").is_empty());
        for id in ["b", "c"] {
            let frames = queued(&relay, id);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].str_field("type"), Some("message"));
            assert_eq!(frames[0].str_field("from"), Some("a"));
            let text = frames[0]
                .as_json()
                .and_then(|v| v.get("payload"))
                .and_then(|p| p.get("text"))
                .and_then(|t| t.as_str());
            assert_eq!(text, Some("yo"));
        }
    }

    #[test]
    fn text_message_is_broadcast_as_string_payload() {
        let mut relay = relay_with(&["a", "b"]);
        let sender = relay.get_client("a").unwrap();
        ChatRelay::new().on_message(&mut relay, &sender, inbound("hello there"));

        let frames = queued(&relay, "b");
        assert_eq!(frames[0].str_field("payload"), Some("hello there"));
    }

    #[test]
    fn direct_message_reaches_only_target() {
        let mut relay = relay_with(&["a", "b", "c"]);
        let sender = relay.get_client("a").unwrap();
        ChatRelay::new().on_message(
            &mut relay,
            &sender,
            inbound(r#"{"type":"direct_message","targetId":"b","payload":"psst"}"#),
        );

        let frames = queued(&relay, "b");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].str_field("type"), Some("direct_message"));
        assert_eq!(frames[0].str_field("from"), Some("a"));
        assert_eq!(frames[0].str_field("payload"), Some("psst"));
        assert!(queued(&relay, "a").is_empty());
        assert!(queued(&relay, "c").is_empty());
    }

    #[test]
    fn direct_message_to_missing_target_errors_back_to_sender() {
        let mut relay = relay_with(&["a", "b"]);
        let sender = relay.get_client("a").unwrap();
        ChatRelay::new().on_message(
            &mut relay,
            &sender,
            inbound(r#"{"type":"direct_message","targetId":"nobody","payload":1}"#),
        );

        let frames = queued(&relay, "a");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].str_field("type"), Some("error"));
        assert_eq!(frames[0].str_field("message"), Some("User nobody not found."));
        assert!(queued(&relay, "b").is_empty());
        assert_eq!(relay.len(), 2);
    }

    #[test]
    fn direct_message_without_target_falls_back_to_broadcast() {
        let mut relay = relay_with(&["a", "b"]);
        let sender = relay.get_client("a").unwrap();
        ChatRelay::new().on_message(&mut relay, &sender, inbound(r#"{"type":"direct_message","payload":1}"#));

        let frames = queued(&relay, "b");
        assert_eq!(frames[0].str_field("type"), Some("message"));
    }

    #[test]
    fn non_string_target_errors_back_and_is_never_broadcast() {
        let mut relay = relay_with(&["a", "b", "c"]);
        let sender = relay.get_client("a").unwrap();
        ChatRelay::new().on_message(
            &mut relay,
            &sender,
            inbound(r#"{"type":"direct_message","targetId":42,"payload":"secret"}"#),
        );

        let frames = queued(&relay, "a");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].str_field("type"), Some("error"));
        assert_eq!(frames[0].str_field("message"), Some("User 42 not found."));
        assert!(queued(&relay, "b").is_empty());
        assert!(queued(&relay, "c").is_empty());
    }

    #[test]
    fn target_id_truthiness() {
        let dm = |target: &str| inbound(&format!(r#"{{"type":"direct_message","targetId":{target}}}"#));

        assert_eq!(direct_target(&dm(r#""b""#)), Some(Target::Client("b")));
        assert_eq!(direct_target(&dm("true")), Some(Target::Unreachable("true".to_string())));
        assert_eq!(direct_target(&dm(r#"["b"]"#)), Some(Target::Unreachable(r#"["b"]"#.to_string())));
        for falsy in ["null", "false", "0", "0.0", r#""""#] {
            assert_eq!(direct_target(&dm(falsy)), None, "{falsy}");
        }
        assert_eq!(direct_target(&inbound(r#"{"type":"chat","targetId":"b"}"#)), None);
    }

    #[test]
    fn disconnection_broadcasts_offline_presence() {
        let mut relay = relay_with(&["b"]);
        let gone = ClientHandle::new(ClientId::from("a"));
        ChatRelay::new().on_disconnection(&mut relay, &gone);

        let frames = queued(&relay, "b");
        assert_eq!(frames[0].str_field("status"), Some("offline"));
        assert_eq!(frames[0].str_field("id"), Some("a"));
    }
}
