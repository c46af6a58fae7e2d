/// Accumulates raw socket reads and yields complete CRLF-terminated lines.
/// Bytes after the last terminator stay buffered until the next read arrives.
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, without its CRLF. Invalid UTF-8 is replaced.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf.drain(..pos + 2);
        Some(line)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// A decoded line while the session is collecting a message body.
#[derive(Debug, PartialEq)]
pub enum BodyLine {
    /// A lone `.`: end of the transfer, never stored.
    Terminator,
    /// Content, with one escape period stripped if present.
    Text(String),
}

pub fn unstuff(line: &str) -> BodyLine {
    if line == "." {
        BodyLine::Terminator
    } else if let Some(rest) = line.strip_prefix('.') {
        BodyLine::Text(rest.to_string())
    } else {
        BodyLine::Text(line.to_string())
    }
}
