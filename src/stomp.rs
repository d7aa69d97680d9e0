//! Minimal STOMP 1.2 text codec for the broker connection.
//!
//! DESIGN
//! ======
//! One WebSocket text message carries one STOMP frame or a heart-beat (a bare
//! end-of-line). The codec covers what the sync client speaks: connect,
//! subscribe, send, disconnect, and the broker's connected/message/receipt/
//! error replies. Header values are escaped per STOMP 1.2 except on
//! `CONNECT`/`CONNECTED`, which STOMP 1.2 leaves unescaped.

use std::fmt;

/// Heart-beat payload: a single end-of-line.
pub const HEARTBEAT: &str = "\n";

/// Error returned by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown STOMP command `{0}`")]
    UnknownCommand(String),
    #[error("malformed header line `{0}`")]
    BadHeader(String),
    #[error("invalid escape sequence in `{0}`")]
    BadEscape(String),
    #[error("frame is not NUL-terminated")]
    MissingTerminator,
    #[error("content-length `{0}` does not fit the body")]
    BadContentLength(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, CodecError> {
        match raw {
            "CONNECT" | "STOMP" => Ok(Self::Connect),
            "CONNECTED" => Ok(Self::Connected),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            "DISCONNECT" => Ok(Self::Disconnect),
            other => Err(CodecError::UnknownCommand(other.to_owned())),
        }
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame. Headers keep wire order; the first occurrence wins on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    // -------------------------------------------------------------------------
    // Client frames
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn connect(host: &str, heartbeat_ms: u64) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe).header("id", id).header("destination", destination).header("ack", "auto")
    }

    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    #[must_use]
    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Encode a frame to its text form, NUL-terminated.
#[must_use]
pub fn encode(frame: &StompFrame) -> String {
    let escape_headers = frame.command.escapes_headers();
    let mut out = String::with_capacity(64 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (key, value) in &frame.headers {
        if escape_headers {
            out.push_str(&escape(key));
            out.push(':');
            out.push_str(&escape(value));
        } else {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode one frame. Returns `Ok(None)` for a heart-beat.
///
/// # Errors
///
/// Returns a [`CodecError`] for unknown commands, malformed headers, bad
/// escapes, or a missing NUL terminator.
pub fn decode(raw: &str) -> Result<Option<StompFrame>, CodecError> {
    let trimmed = raw.trim_start_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Ok(None);
    }

    let (head, rest) = split_head(trimmed).ok_or(CodecError::MissingTerminator)?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let command = Command::parse(lines.next().unwrap_or_default())?;
    let unescape_headers = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let (key, value) = line.split_once(':').ok_or_else(|| CodecError::BadHeader(line.to_owned()))?;
        if unescape_headers {
            headers.push((unescape(key)?, unescape(value)?));
        } else {
            headers.push((key.to_owned(), value.to_owned()));
        }
    }

    let frame_len = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.parse::<usize>().map_err(|_| CodecError::BadContentLength(v.clone())))
        .transpose()?;
    let body = match frame_len {
        Some(len) => {
            let body = rest.get(..len).ok_or_else(|| CodecError::BadContentLength(len.to_string()))?;
            if !rest[len..].starts_with('\0') {
                return Err(CodecError::MissingTerminator);
            }
            body
        }
        None => rest.split_once('\0').map(|(body, _)| body).ok_or(CodecError::MissingTerminator)?,
    };

    Ok(Some(StompFrame { command, headers, body: body.to_owned() }))
}

/// Split at the blank line separating headers from body.
fn split_head(raw: &str) -> Option<(&str, &str)> {
    let lf = raw.find("\n\n").map(|i| (i, 2));
    let crlf = raw.find("\r\n\r\n").map(|i| (i, 4));
    let (at, sep) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&raw[..at], &raw[at + sep..]))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::BadEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "stomp_test.rs"]
mod tests;
