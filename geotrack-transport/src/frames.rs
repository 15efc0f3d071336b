use anyhow::bail;
use geotrack_logic::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A single STOMP 1.2 frame
pub struct StompFrame {
    pub command: String,
    headers: Vec<(String, String)>,
    pub body: String,
}

/// CONNECT and CONNECTED frames carry their headers unescaped
fn escapes_headers(command: &str) -> bool {
    !matches!(command, "CONNECT" | "CONNECTED")
}

fn escape(raw: &str, out: &mut String) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => bail!("Invalid header escape \\{other}"),
            None => bail!("Header ends in a lone backslash"),
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

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the header `name`, if repeated the first one wins
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let escaping = escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escaping {
                escape(name, &mut out);
                out.push(':');
                escape(value, &mut out);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame, `raw` is everything up to (not including) the NUL terminator
    fn parse(raw: &str) -> Result<Self> {
        let mut rest = raw;
        let mut lines = Vec::new();

        loop {
            let Some(end) = rest.find('\n') else {
                bail!("Frame has no blank line after its headers");
            };
            let line = &rest[..end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            rest = &rest[end + 1..];
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let Some((command, header_lines)) = lines.split_first() else {
            bail!("Frame has no command");
        };

        let escaping = escapes_headers(command);
        let headers = header_lines
            .iter()
            .map(|line| {
                let Some((name, value)) = line.split_once(':') else {
                    bail!("Malformed header line {line:?}");
                };
                if escaping {
                    Ok((unescape(name)?, unescape(value)?))
                } else {
                    Ok((name.to_string(), value.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            command: command.to_string(),
            headers,
            body: rest.to_string(),
        })
    }
}

#[derive(Debug, Default)]
/// Reassembles frames out of arbitrarily split WebSocket messages
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    /// Feed in received text, returns every frame it completed in order.
    /// Heart-beat EOLs between frames are skipped.
    pub fn push(&mut self, text: &str) -> Result<Vec<StompFrame>> {
        self.buffer.push_str(text);
        let mut frames = Vec::new();

        loop {
            let start = self
                .buffer
                .find(|c: char| c != '\n' && c != '\r')
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..start);

            let Some(end) = self.buffer.find('\0') else {
                break;
            };

            let frame = StompFrame::parse(&self.buffer[..end]);
            self.buffer.drain(..=end);
            frames.push(frame.context("Failed to parse STOMP frame")?);
        }

        Ok(frames)
    }
}
