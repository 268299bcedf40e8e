/// Tracks how much of the published content has already been written out.
#[derive(Debug, Default)]
pub struct SuffixPrinter {
    shown: String,
}

impl SuffixPrinter {
    /// Returns the part of `content` not written yet.
    ///
    /// Content that does not extend what was shown belongs to a new stream
    /// and is written from the start.
    pub fn advance<'a>(&mut self, content: &'a str) -> &'a str {
        if !content.starts_with(self.shown.as_str()) {
            self.shown.clear();
        }
        let suffix = &content[self.shown.len()..];
        self.shown.push_str(suffix);
        suffix
    }

    pub fn has_output(&self) -> bool {
        !self.shown.is_empty()
    }
}
