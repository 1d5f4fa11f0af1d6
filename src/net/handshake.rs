use base64::Engine;
use ring::digest;
use thiserror::Error;

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const UPGRADE_REQUIRED_BODY: &str = "Upgrade required";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request head exceeds {max} bytes without terminating")]
    TooLarge { max: usize },
    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

/// An HTTP/1.1 request head read off a freshly accepted socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup; the first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn websocket_key(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Key").filter(|key| !key.is_empty())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("Upgrade")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
            })
            .unwrap_or(false);
        upgrade && self.websocket_key().is_some()
    }
}

/// Parses a request head from the front of `buf`.
/// Returns Ok(Some((request, bytes_consumed))) once the blank line has arrived,
/// Ok(None) while more bytes are needed.
pub fn parse_request(buf: &[u8], max_len: usize) -> Result<Option<(UpgradeRequest, usize)>, HandshakeError> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > max_len {
            return Err(HandshakeError::TooLarge { max: max_len });
        }
        return Ok(None);
    };
    if end > max_len {
        return Err(HandshakeError::TooLarge { max: max_len });
    }

    let head = std::str::from_utf8(&buf[..end]).map_err(|_| HandshakeError::Malformed("request head is not UTF-8"))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(HandshakeError::Malformed("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(HandshakeError::Malformed("bad request line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(HandshakeError::Malformed("bad HTTP version"));
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(HandshakeError::Malformed("header without colon"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some((
        UpgradeRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        },
        end + 4,
    )))
}

/// base64(SHA-1(key + GUID)), the value of `Sec-WebSocket-Accept`.
pub fn accept_key(client_key: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(client_key.as_bytes());
    ctx.update(WS_GUID.as_bytes());
    let hash = ctx.finish();
    base64::engine::general_purpose::STANDARD.encode(hash.as_ref())
}

/// The `101 Switching Protocols` response. No subprotocol or extension negotiation.
pub fn handshake_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
}

/// Reply to a plain HTTP request on the WebSocket port.
pub fn upgrade_required_response() -> Vec<u8> {
    let mut len = itoa::Buffer::new();
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"HTTP/1.1 426 Upgrade Required\r\nContent-Type: text/plain\r\nConnection: close\r\nContent-Length: ");
    out.extend_from_slice(len.format(UPGRADE_REQUIRED_BODY.len()).as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(UPGRADE_REQUIRED_BODY.as_bytes());
    out
}
