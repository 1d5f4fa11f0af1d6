use std::borrow::Borrow;
use std::fmt;

use ring::rand::SecureRandom;
use serde::Serialize;

use crate::error::{RelayError, Result};
use crate::relay::Relay;

/// Opaque client identifier: 16 random bytes rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub const RANDOM_BYTES: usize = 16;

    /// Draws a fresh id. No collision check: 128 bits make one negligible.
    pub fn generate(rng: &impl SecureRandom) -> Result<Self> {
        let mut bytes = [0u8; Self::RANDOM_BYTES];
        rng.fill(&mut bytes).map_err(|_| RelayError::Rng)?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Ids received from the outside (message targets, console input) are taken as-is;
/// a bogus id simply never matches a registry entry.
impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// What observers get for a client: the id only. Every operation looks the
/// connection up in the [`Relay`] at call time, so a handle that outlives its
/// connection degrades to "client not connected" instead of writing to a dead socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    id: ClientId,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn send<T: Serialize + ?Sized>(&self, relay: &mut Relay, data: &T) -> Result<()> {
        relay.send(self.id.as_str(), data)
    }

    pub fn is_connected(&self, relay: &Relay) -> bool {
        relay.get_client(self.id.as_str()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_32_hex_chars() {
        let id = ClientId::generate(&SystemRandom::new()).unwrap();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let rng = SystemRandom::new();
        let ids: HashSet<ClientId> = (0..1000).map(|_| ClientId::generate(&rng).unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn serializes_as_bare_string() {
        let id = ClientId::from("abc123");
        assert_eq!(simd_json::to_string(&id).unwrap(), r#""abc123""#);
    }
}
