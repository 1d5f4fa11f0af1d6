//! Application message shapes sent by the server.
//!
//! Every message is a JSON object with a `type` discriminator. The frame codec
//! does not care about these; they are the convention the relay and the chat
//! application share with browser clients.

use serde::Serialize;
use simd_json::OwnedValue;

use crate::net::framing::Payload;
use crate::relay::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Welcome {
        message: String,
    },
    Presence {
        status: PresenceStatus,
        id: &'a ClientId,
    },
    Announcement {
        message: &'a str,
    },
    /// A broadcast chat message; `payload` is the sender's whole message.
    Message {
        from: &'a ClientId,
        payload: &'a Payload,
    },
    DirectMessage {
        from: &'a ClientId,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a OwnedValue>,
    },
    Error {
        message: String,
    },
    /// Last message a client sees before the server drops it.
    Disconnect {
        reason: &'a str,
    },
}
