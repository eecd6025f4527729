//! HTTP/1.1 upgrade handshake for WebSocket connections.
//!
//! The server reads one request head (everything up to the first blank
//! line), decides whether it is a WebSocket upgrade or a health probe, and
//! answers with a fixed-format response. Anything else closes the
//! connection without a response.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client nonce before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest request head accepted before the upgrade (8 KiB).
pub const MAX_HEAD_SIZE: usize = 8192;

/// Path answered by the health probe.
pub const HEALTH_PATH: &str = "/health";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Handshake failures. Every variant closes the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,

    #[error("request is not a websocket upgrade")]
    NotUpgrade,

    #[error("request head exceeds {max} bytes")]
    HeadTooLarge { max: usize },

    #[error("connection closed during handshake")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Derives the `Sec-WebSocket-Accept` value for a client nonce.
pub fn compute_accept_key(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Returns the length of the request head including its blank line, if the
/// terminator has arrived.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

// ============================================================================
// Request Parsing
// ============================================================================

/// A parsed HTTP request head. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Parses a request line followed by `Name: value` header lines.
    pub fn parse(head: &str) -> Result<Self, HandshakeError> {
        let mut lines = head.split("\r\n");

        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| HandshakeError::MalformedRequest("empty request".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::MalformedRequest(format!(
                "bad request line: {request_line}"
            )));
        };

        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::MalformedRequest(format!(
                "bad http version: {version}"
            )));
        }

        let mut headers = HashMap::new();
        for line in lines.take_while(|line| !line.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                HandshakeError::MalformedRequest(format!("bad header line: {line}"))
            })?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True if a comma-separated header contains `token` (case-insensitive).
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    /// True for a plain `GET /health` probe.
    pub fn is_health_probe(&self) -> bool {
        self.method == "GET"
            && self.path.split('?').next() == Some(HEALTH_PATH)
            && !self.header_has_token("upgrade", "websocket")
    }
}

/// A validated WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
}

impl UpgradeRequest {
    /// Validates the upgrade headers.
    ///
    /// Requires `GET`, `Upgrade: websocket` and a `Sec-WebSocket-Key` that
    /// decodes to a 16-byte nonce.
    pub fn from_request(request: &HttpRequest) -> Result<Self, HandshakeError> {
        if request.method != "GET" || !request.header_has_token("upgrade", "websocket") {
            return Err(HandshakeError::NotUpgrade);
        }

        let key = request
            .header("sec-websocket-key")
            .ok_or(HandshakeError::MissingKey)?;

        match STANDARD.decode(key) {
            Ok(nonce) if nonce.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        Ok(Self {
            path: request.path.clone(),
            key: key.to_string(),
        })
    }

    pub fn accept_key(&self) -> String {
        compute_accept_key(&self.key)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// The `101 Switching Protocols` response for an accept key.
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
}

/// Body of the health probe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub transport: String,
    pub instance: String,
    pub time: String,
}

impl HealthReport {
    pub fn ok(transport: &str, instance: &str, time: String) -> Self {
        Self {
            status: "ok".to_string(),
            transport: transport.to_string(),
            instance: instance.to_string(),
            time,
        }
    }
}

/// A complete `200 OK` response carrying a JSON body.
pub fn health_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_NONCE: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_head(key: &str) -> String {
        format!(
            "GET /chat HTTP/1.1\r\n\
             Host: localhost:3000\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        )
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            compute_accept_key(SAMPLE_NONCE),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n\x81\x00"), Some(18));
    }

    #[test]
    fn test_parse_upgrade_request() {
        let request = HttpRequest::parse(&upgrade_head(SAMPLE_NONCE)).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/chat");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("SEC-WEBSOCKET-KEY"), Some(SAMPLE_NONCE));
        assert!(request.header_has_token("connection", "upgrade"));

        let upgrade = UpgradeRequest::from_request(&request).unwrap();
        assert_eq!(upgrade.key, SAMPLE_NONCE);
        assert_eq!(upgrade.accept_key(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            HttpRequest::parse(""),
            Err(HandshakeError::MalformedRequest(_))
        ));
        assert!(matches!(
            HttpRequest::parse("hello\r\n\r\n"),
            Err(HandshakeError::MalformedRequest(_))
        ));
        assert!(matches!(
            HttpRequest::parse("GET / FTP/1.0\r\n\r\n"),
            Err(HandshakeError::MalformedRequest(_))
        ));
        assert!(matches!(
            HttpRequest::parse("GET / HTTP/1.1\r\nno-colon-here\r\n\r\n"),
            Err(HandshakeError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_upgrade_requires_headers() {
        let plain = HttpRequest::parse("GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(
            UpgradeRequest::from_request(&plain),
            Err(HandshakeError::NotUpgrade)
        );

        let no_key =
            HttpRequest::parse("GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").unwrap();
        assert_eq!(
            UpgradeRequest::from_request(&no_key),
            Err(HandshakeError::MissingKey)
        );

        let post = HttpRequest::parse(&upgrade_head(SAMPLE_NONCE).replacen("GET", "POST", 1))
            .unwrap();
        assert_eq!(
            UpgradeRequest::from_request(&post),
            Err(HandshakeError::NotUpgrade)
        );
    }

    #[test]
    fn test_upgrade_rejects_bad_keys() {
        for key in ["not base64!", "c2hvcnQ=", ""] {
            let request = HttpRequest::parse(&upgrade_head(key)).unwrap();
            assert_eq!(
                UpgradeRequest::from_request(&request),
                Err(HandshakeError::InvalidKey),
                "key {key:?}"
            );
        }
    }

    #[test]
    fn test_upgrade_response_format() {
        let response = upgrade_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(
            response,
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_health_probe_detection() {
        let probe = HttpRequest::parse("GET /health HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(probe.is_health_probe());

        let with_query = HttpRequest::parse("GET /health?full=1 HTTP/1.1\r\n\r\n").unwrap();
        assert!(with_query.is_health_probe());

        let head = upgrade_head(SAMPLE_NONCE).replacen("/chat", "/health", 1);
        let upgrade = HttpRequest::parse(&head).unwrap();
        assert!(!upgrade.is_health_probe());

        let other = HttpRequest::parse("GET /status HTTP/1.1\r\n\r\n").unwrap();
        assert!(!other.is_health_probe());
    }

    #[test]
    fn test_health_response() {
        let report = HealthReport::ok("websocket", "node-a", "2024-01-01T00:00:00Z".to_string());
        let body = serde_json::to_string(&report).unwrap();
        let response = health_response(&body);

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains(&format!("Content-Length: {}\r\n", body.len())));

        let (_, payload) = response.split_once("\r\n\r\n").unwrap();
        let parsed: HealthReport = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.transport, "websocket");
        assert_eq!(parsed.instance, "node-a");
    }
}
