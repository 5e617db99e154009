use super::utf8::Utf8ChunkDecoder;

/// Blank line separating two frames on the wire.
pub const FRAME_DELIMITER: &str = "\n\n";

/// One complete `event:`/`data:` unit decoded from the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Turns arbitrarily cut byte chunks into complete frames.
///
/// Text that does not yet end in a frame delimiter stays buffered until the next chunk.
/// Candidates that do not match the two-line `event:`/`data:` shape are dropped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    text: Utf8ChunkDecoder,
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every frame completed by them, in arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let text = self.text.decode(chunk);
        self.push_str(&text)
    }

    /// Feeds already-decoded text.
    pub fn push_str(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..].find(FRAME_DELIMITER) {
            let candidate = &self.buffer[consumed..consumed + offset];
            match parse_frame(candidate) {
                Some(frame) => frames.push(frame),
                None if candidate.trim().is_empty() => {}
                None => {
                    tracing::debug!(
                        candidate_len = candidate.len(),
                        "discarding malformed stream frame"
                    );
                }
            }
            consumed += offset + FRAME_DELIMITER.len();
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        frames
    }

    /// Length of the partial frame currently held.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.text.pending_len()
    }

    /// Ends the stream. A partial trailing frame is discarded, never emitted.
    ///
    /// Returns the number of bytes that were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffered_len();
        self.text.finish();
        self.buffer.clear();

        if dropped > 0 {
            tracing::debug!(dropped, "stream ended inside a frame; discarding remainder");
        }

        dropped
    }
}

/// Parses one delimiter-free candidate into a frame.
///
/// The expected shape is an `event: <name>` line immediately followed by a
/// `data: <payload>` line. Leading blank lines are skipped and trailing lines ignored.
pub fn parse_frame(candidate: &str) -> Option<Frame> {
    let mut lines = candidate.lines().skip_while(|line| line.trim().is_empty());

    let event = field_value(lines.next()?, "event")?.trim();
    if event.is_empty() {
        return None;
    }
    let data = field_value(lines.next()?, "data")?;

    Some(Frame::new(event, data))
}

fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let value = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
