//! Relay configuration.
//!
//! Values come from the binary's command line, which falls back to `RELAY_*`
//! environment variables (a `.env` file is loaded first in development).

use std::net::SocketAddr;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_HANDSHAKE_LEN: usize = 8 * 1024;
pub const DEFAULT_READ_CHUNK: usize = 4096;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("max_handshake_len ({0}) must be at least 64 bytes")]
    HandshakeTooSmall(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to.
    pub addr: SocketAddr,
    /// Largest payload a single client frame may declare. Larger frames close the connection.
    pub max_frame_len: usize,
    /// Largest HTTP request head accepted before the upgrade.
    pub max_handshake_len: usize,
    /// Bytes read from a socket per `read` call.
    pub read_chunk: usize,
    /// mio event buffer size.
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_handshake_len: DEFAULT_MAX_HANDSHAKE_LEN,
            read_chunk: DEFAULT_READ_CHUNK,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_len == 0 {
            return Err(ConfigError::Zero { field: "max_frame_len" });
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::Zero { field: "read_chunk" });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero { field: "event_capacity" });
        }
        if self.max_handshake_len < 64 {
            return Err(ConfigError::HandshakeTooSmall(self.max_handshake_len));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RelayConfig::default();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_frame_limit_is_rejected() {
        let config = RelayConfig {
            max_frame_len: 0,
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { field: "max_frame_len" }));
    }

    #[test]
    fn tiny_handshake_limit_is_rejected() {
        let config = RelayConfig {
            max_handshake_len: 10,
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::HandshakeTooSmall(10)));
    }
}
