//! Turns framed events into assistant text.
//!
//! Only `data:` lines carry content. Their payload may be wrapped in one layer
//! of quotes, may carry literal `\n` / `\\` escapes and escaped math
//! delimiters, or may be a control sentinel that must not reach the output.
//! Nothing in this module fails: a line that cannot be used contributes an
//! empty string.

use crate::framer::FramedEvent;
use crate::normalize::normalize;

const DATA_PREFIX: &str = "data:";

/// Sentinel payloads recognised when no list is configured.
pub const DEFAULT_SENTINELS: &[&str] = &["Connection closed", "[DONE]"];

/// Classification of one event line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    /// A `data:` line; holds the trimmed payload after the prefix.
    Data(&'a str),
    /// Anything else (comments, `event:`/`id:` fields, blank lines).
    Ignorable,
}

/// Classifies a single line of a framed event.
pub fn classify_line(line: &str) -> LineKind<'_> {
    match line.strip_prefix(DATA_PREFIX) {
        Some(rest) => LineKind::Data(rest.trim()),
        None => LineKind::Ignorable,
    }
}

/// Returns the text contributed by one data payload.
pub fn extract_payload<S: AsRef<str>>(payload: &str, sentinels: &[S]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    let unquoted = strip_one_quote_layer(payload);
    if is_sentinel(payload, sentinels) || is_sentinel(unquoted, sentinels) {
        return String::new();
    }
    normalize(&unescape(unquoted))
}

/// Returns the text contributed by a whole event (the delta).
pub fn extract<S: AsRef<str>>(event: &FramedEvent, sentinels: &[S]) -> String {
    let mut delta = String::new();
    for line in event.lines() {
        if let LineKind::Data(payload) = classify_line(line) {
            delta.push_str(&extract_payload(payload, sentinels));
        }
    }
    delta
}

fn is_sentinel<S: AsRef<str>>(payload: &str, sentinels: &[S]) -> bool {
    sentinels.iter().any(|s| s.as_ref() == payload)
}

fn strip_one_quote_layer(payload: &str) -> &str {
    for quote in ['\'', '"'] {
        if payload.len() >= 2 && payload.starts_with(quote) && payload.ends_with(quote) {
            return &payload[1..payload.len() - 1];
        }
    }
    payload
}

/// Single left-to-right pass: `\\` → `\`, `\n` → newline. Other escapes are
/// kept as written.
fn unescape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
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

/// Running content of one stream. Only ever grows.
#[derive(Debug)]
pub struct ContentAccumulator {
    content: String,
    sentinels: Vec<String>,
}

impl Default for ContentAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINELS.iter().map(|s| s.to_string()).collect())
    }
}

impl ContentAccumulator {
    pub fn new(sentinels: Vec<String>) -> Self {
        Self {
            content: String::new(),
            sentinels,
        }
    }

    /// Appends the event's delta and returns it.
    pub fn apply(&mut self, event: &FramedEvent) -> &str {
        let delta = extract(event, &self.sentinels);
        let start = self.content.len();
        self.content.push_str(&delta);
        &self.content[start..]
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn into_content(self) -> String {
        self.content
    }
}
