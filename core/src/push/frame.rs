/// STOMP 1.2 text frames carried over the push WebSocket
use crate::error::{Result, SyncError};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => {
                return Err(SyncError::Push(format!("Unknown STOMP command: {}", other)));
            }
        })
    }

    /// CONNECT/CONNECTED headers are exempt from escaping
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
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

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins for repeated headers
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, auth_token: Option<&str>) -> Self {
        let mut frame = StompFrame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0");
        if let Some(token) = auth_token {
            frame = frame.header("Authorization", format!("Bearer {}", token));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        StompFrame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        StompFrame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send_json(destination: &str, body: String) -> Self {
        StompFrame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    /// Serialize to wire text (headers, blank line, body, NUL)
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decode every frame in a WebSocket text message. Heart-beat EOLs yield nothing.
pub fn decode_all(input: &str) -> Result<Vec<StompFrame>> {
    let mut frames = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            break;
        }
        let (frame, consumed) = decode_one(rest)?;
        frames.push(frame);
        rest = &rest[consumed..];
    }
    Ok(frames)
}

fn decode_one(input: &str) -> Result<(StompFrame, usize)> {
    let mut pos = 0;
    let command_line = read_line(input, &mut pos)
        .ok_or_else(|| SyncError::Push("Truncated STOMP frame".to_string()))?;
    let command = Command::parse(command_line)?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = read_line(input, &mut pos)
            .ok_or_else(|| SyncError::Push("Unterminated STOMP headers".to_string()))?;
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| SyncError::Push(format!("Malformed STOMP header: {}", line)))?;
        if unescape {
            headers.push((unescape_header(k), unescape_header(v)));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let body_start = pos;
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());
    let body_end = match content_length {
        Some(len) => {
            let end = body_start
                .checked_add(len)
                .filter(|end| *end < input.len())
                .ok_or_else(|| {
                    SyncError::Push(format!("STOMP content-length {} exceeds frame", len))
                })?;
            if input.as_bytes()[end] != 0 {
                return Err(SyncError::Push(
                    "STOMP body does not match content-length".to_string(),
                ));
            }
            end
        }
        None => input[body_start..]
            .find('\0')
            .map(|i| body_start + i)
            .ok_or_else(|| SyncError::Push("STOMP frame missing NUL terminator".to_string()))?,
    };
    let body = input
        .get(body_start..body_end)
        .ok_or_else(|| SyncError::Push("STOMP body is not valid UTF-8".to_string()))?;

    Ok((
        StompFrame {
            command,
            headers,
            body: body.to_string(),
        },
        body_end + 1,
    ))
}

fn read_line<'a>(input: &'a str, pos: &mut usize) -> Option<&'a str> {
    let rest = &input[*pos..];
    let end = rest.find('\n')?;
    *pos += end + 1;
    Some(rest[..end].trim_end_matches('\r'))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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

fn unescape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
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
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
