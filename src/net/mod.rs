//! Wire level: HTTP upgrade handshake, WebSocket frame codec and socket setup.

pub mod framing;
pub mod handshake;
pub mod tcp_opt;
