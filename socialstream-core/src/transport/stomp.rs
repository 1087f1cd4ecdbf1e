//! STOMP 1.2 frame codec
//!
//! Only the subset the backend speaks: CONNECT/CONNECTED, SUBSCRIBE,
//! UNSUBSCRIBE, SEND, MESSAGE, RECEIPT, ERROR and DISCONNECT. A WebSocket
//! text message carries at most one frame; a message consisting only of
//! EOLs is a heart-beat.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while decoding a frame
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Frame is missing its NUL terminator")]
    Unterminated,
}

/// STOMP frame commands
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
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are not escaped in STOMP 1.2
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header; the first occurrence wins
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame carrying the bearer credential and heart-beat offer
    pub fn connect(host: &str, token: Option<&str>, heartbeat_ms: u64) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat_ms, heartbeat_ms));

        if let Some(token) = token {
            frame = frame.header("Authorization", format!("Bearer {}", token));
        }

        frame
    }

    pub fn subscribe(id: u64, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", format!("sub-{}", id))
            .header("destination", destination)
    }

    pub fn unsubscribe(id: u64) -> Self {
        Frame::new(Command::Unsubscribe).header("id", format!("sub-{}", id))
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Subscription id of a MESSAGE frame, as handed out by [`Frame::subscribe`]
    pub fn subscription_id(&self) -> Option<u64> {
        self.get("subscription")?.strip_prefix("sub-")?.parse().ok()
    }

    /// Serialize to wire text (NUL terminated)
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.command == Command::Send {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame from a WebSocket text message.
    ///
    /// Returns `Ok(None)` for a heart-beat (EOLs only).
    pub fn decode(text: &str) -> Result<Option<Frame>, FrameError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let end = text.find('\0').ok_or(FrameError::Unterminated)?;
        let raw = &text[..end];

        let (head, body) = match raw.find("\n\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(idx) => (&raw[..idx], &raw[idx + 4..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.lines();
        let command_line = lines.next().ok_or(FrameError::Empty)?.trim_end_matches('\r');
        if command_line.is_empty() {
            return Err(FrameError::Empty);
        }
        let command = Command::parse(command_line)?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name), unescape_header(value)));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        Ok(Some(Frame {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

/// The heart-beat payload
pub const HEARTBEAT: &str = "\n";

/// Heart-beat periods agreed in the CONNECT/CONNECTED exchange.
/// `None` means that direction is switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// How often we must send
    pub outgoing: Option<Duration>,
    /// How often the server promised to send
    pub incoming: Option<Duration>,
}

impl Heartbeat {
    /// Combine our offer (same period both ways) with the CONNECTED frame's
    /// `heart-beat:sx,sy`. A missing or unreadable header means `0,0`.
    pub fn negotiate(offer_ms: u64, connected: &Frame) -> Self {
        let (sx, sy) = connected
            .get("heart-beat")
            .and_then(|v| v.split_once(','))
            .and_then(|(sx, sy)| Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?)))
            .unwrap_or((0, 0));

        let period = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };

        Self {
            outgoing: period(offer_ms, sy),
            incoming: period(offer_ms, sx),
        }
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_frame() {
        let text = Frame::connect("localhost", Some("abc"), 10000).encode();
        assert!(text.starts_with("CONNECT\n"));
        assert!(text.contains("accept-version:1.2\n"));
        assert!(text.contains("heart-beat:10000,10000\n"));
        assert!(text.contains("Authorization:Bearer abc\n"));
        assert!(text.ends_with("\n\n\0"));
    }

    #[test]
    fn test_decode_message() {
        let text = "MESSAGE\ndestination:/topic/room/4\nsubscription:sub-7\nmessage-id:1\n\n{\"action\":\"PLAY\"}\0";
        let frame = Frame::decode(text).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("destination"), Some("/topic/room/4"));
        assert_eq!(frame.subscription_id(), Some(7));
        assert_eq!(frame.body, "{\"action\":\"PLAY\"}");
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(Frame::decode("\n").unwrap(), None);
        assert_eq!(Frame::decode("\r\n\n").unwrap(), None);
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            Frame::decode("BOGUS\n\n\0"),
            Err(FrameError::UnknownCommand("BOGUS".to_string()))
        );
        assert_eq!(Frame::decode("MESSAGE\n\nbody"), Err(FrameError::Unterminated));
        assert!(matches!(
            Frame::decode("MESSAGE\nno-colon\n\n\0"),
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_send_escapes_headers() {
        let frame = Frame::send("/app/a:b", "{}");
        let text = frame.encode();
        assert!(text.contains("destination:/app/a\\cb\n"));
        assert!(text.contains("content-length:2\n"));

        let back = Frame::decode(&text).unwrap().unwrap();
        assert_eq!(back.get("destination"), Some("/app/a:b"));
        assert_eq!(back.body, "{}");
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let connected = |value: &str| Frame::new(Command::Connected).header("heart-beat", value);

        let agreed = Heartbeat::negotiate(10_000, &connected("20000,5000"));
        assert_eq!(agreed.outgoing, Some(Duration::from_secs(10)));
        assert_eq!(agreed.incoming, Some(Duration::from_secs(20)));

        let silent = Heartbeat::negotiate(10_000, &connected("0,0"));
        assert_eq!(silent.outgoing, None);
        assert_eq!(silent.incoming, None);

        let one_way = Heartbeat::negotiate(10_000, &connected("0,15000"));
        assert_eq!(one_way.outgoing, Some(Duration::from_secs(15)));
        assert_eq!(one_way.incoming, None);

        assert_eq!(
            Heartbeat::negotiate(10_000, &Frame::new(Command::Connected)),
            Heartbeat::negotiate(10_000, &connected("0,0"))
        );
        assert_eq!(Heartbeat::negotiate(0, &connected("5000,5000")).incoming, None);
    }

    #[test]
    fn test_error_frame_with_crlf() {
        let frame = Frame::decode("ERROR\r\nmessage:bad token\r\n\r\n\0").unwrap().unwrap();
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.get("message"), Some("bad token"));
    }
}
