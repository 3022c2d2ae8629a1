//! Incremental server-sent-events frame decoder.
//!
//! Bytes go in as they arrive off the wire; complete frames come out. Frames
//! are delimited by a blank line. `\r\n` line endings are accepted, comment
//! lines (`:`) are skipped, and multiple `data:` lines are joined with `\n`.

/// One decoded SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes. Carriage returns are dropped here, so a frame boundary
    /// split across chunks is still found.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Pop the next complete frame. Frames without any `data:` line (pure
    /// comments, keep-alives) are consumed and skipped.
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let end = self.buf.windows(2).position(|w| w == b"\n\n")?;
            let raw: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(frame) = parse_frame(&raw[..end]) {
                return Some(frame);
            }
        }
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if let Some(frame) = self.next_frame() {
            return Some(frame);
        }
        let raw = std::mem::take(&mut self.buf);
        parse_frame(&raw)
    }
}

fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "id" => frame.id = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}
