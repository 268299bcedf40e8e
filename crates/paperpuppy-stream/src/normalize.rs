//! Repairs backslash-escaped LaTeX delimiters emitted by the upstream model.
//!
//! `\[ … \]` becomes `$$ … $$` and `\( … \)` becomes `$ … $`. A delimiter may
//! carry one extra backslash (`\\[`) because the transport sometimes escapes
//! twice.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static BLOCK_MATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\\\?\[([\s\S]*?)\\\\?\]").expect("block math pattern is valid")
});

static INLINE_MATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\\\?\(([\s\S]*?)\\\\?\)").expect("inline math pattern is valid")
});

/// Rewrites escaped math delimiters into dollar delimiters.
///
/// The inner content is kept verbatim. Passes repeat until the text is
/// stable, so `normalize(normalize(s)) == normalize(s)` holds for every input;
/// each productive pass removes at least two backslashes, which bounds the
/// loop.
pub fn normalize(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let block = BLOCK_MATH.replace_all(&current, |caps: &Captures<'_>| {
            format!("$${}$$", &caps[1])
        });
        let block_changed = matches!(block, Cow::Owned(_));
        let block = block.into_owned();

        let inline = INLINE_MATH.replace_all(&block, |caps: &Captures<'_>| {
            format!("${}$", &caps[1])
        });
        let inline_changed = matches!(inline, Cow::Owned(_));

        if !block_changed && !inline_changed {
            return current;
        }
        current = inline.into_owned();
    }
}
