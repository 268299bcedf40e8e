/// Text between two event separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedEvent {
    raw: String,
}

impl FramedEvent {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Raw event text without the trailing separator.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Lines of the event with any trailing `\r` removed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.raw
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
    }
}

/// Reassembles decoded chunks into events at blank-line boundaries.
///
/// One framer serves one stream; the carry-over holds the incomplete tail of
/// the last chunk.
#[derive(Debug, Default)]
pub struct ChunkFramer {
    carry: String,
}

impl ChunkFramer {
    /// Appends `chunk` and returns every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<FramedEvent> {
        self.carry.push_str(chunk);
        let mut events = Vec::new();
        while let Some((idx, delim_len)) = find_event_delimiter(self.carry.as_bytes()) {
            let raw: String = self.carry.drain(..idx + delim_len).collect();
            events.push(FramedEvent::new(&raw[..idx]));
        }
        events
    }

    /// Emits the carry-over as a final event if it holds anything but
    /// whitespace. Trailing data without a separator is never dropped.
    pub fn finish(&mut self) -> Option<FramedEvent> {
        let raw = std::mem::take(&mut self.carry);
        if raw.trim().is_empty() {
            None
        } else {
            Some(FramedEvent::new(raw))
        }
    }

    /// Clears the carry-over.
    pub fn reset(&mut self) {
        self.carry.clear();
    }

    /// Bytes waiting for a separator.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }
}

/// Finds the earliest `\n\n` or `\r\n\r\n`; returns its index and length.
fn find_event_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}
