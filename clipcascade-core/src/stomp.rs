use crate::CoreError;

pub const HEART_BEAT: &str = "10000,10000";
pub const ACCEPT_VERSION: &str = "1.1,1.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::InvalidStompFrame(message.into())
}

fn escapes_headers(command: &str) -> bool {
    !matches!(command, "CONNECT" | "CONNECTED" | "STOMP")
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => return Err(invalid(format!("undefined header escape \\{other:?}"))),
        }
    }
    Ok(out)
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `key`; STOMP gives repeated headers first-wins semantics.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str) -> Self {
        Self::new("CONNECT")
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", HEART_BEAT)
    }

    pub fn connected() -> Self {
        Self::new("CONNECTED")
            .header("version", "1.2")
            .header("heart-beat", "0,0")
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn message(subscription: &str, message_id: &str, destination: &str, body: &str) -> Self {
        Self::new("MESSAGE")
            .header("subscription", subscription)
            .header("message-id", message_id)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn error(message: &str) -> Self {
        Self::new("ERROR").header("message", message)
    }

    pub fn disconnect() -> Self {
        Self::new("DISCONNECT")
    }

    pub fn encode(&self) -> String {
        let escape = escapes_headers(&self.command);
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (key, value) in &self.headers {
            if key == "content-length" {
                continue;
            }
            if escape {
                out.push_str(&escape_header(key));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses one frame. A frame made only of line breaks is a heart-beat and
    /// yields `Ok(None)`.
    pub fn decode(raw: &str) -> Result<Option<Self>, CoreError> {
        let frame = raw.trim_start_matches(['\r', '\n']);
        if frame.is_empty() || frame == "\0" {
            return Ok(None);
        }

        let (head, rest) = match (frame.find("\r\n\r\n"), frame.find("\n\n")) {
            (Some(crlf), Some(lf)) if crlf < lf => (&frame[..crlf], &frame[crlf + 4..]),
            (_, Some(lf)) => (&frame[..lf], &frame[lf + 2..]),
            (Some(crlf), None) => (&frame[..crlf], &frame[crlf + 4..]),
            (None, None) => return Err(invalid("missing blank line after headers")),
        };

        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));
        let command = lines
            .next()
            .filter(|command| !command.is_empty())
            .ok_or_else(|| invalid("missing command"))?
            .to_owned();
        let escape = escapes_headers(&command);

        let mut headers = Vec::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| invalid(format!("header line without ':': {line:?}")))?;
            if escape {
                headers.push((unescape_header(key)?, unescape_header(value)?));
            } else {
                headers.push((key.to_owned(), value.to_owned()));
            }
        }

        let mut parsed = Self {
            command,
            headers,
            body: String::new(),
        };

        let body = match parsed.get("content-length") {
            Some(length) => {
                let length: usize = length
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("bad content-length {length:?}")))?;
                rest.get(..length)
                    .ok_or_else(|| invalid("content-length exceeds frame"))?
            }
            None => rest.split('\0').next().unwrap_or_default(),
        };
        parsed.body = body.to_owned();
        Ok(Some(parsed))
    }
}
