//! Editor-facing description of a text edit.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Replace the characters in `span` with `content`.
///
/// Offsets are character (Unicode scalar) indexes into the text *before* the
/// change. Inserting "a" after the 4th character is `4..4 => "a"`; deleting
/// the 4th character is `3..4 => ""`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub span: Range<usize>,
    pub content: String,
}

impl TextChange {
    pub fn new(span: Range<usize>, content: impl Into<String>) -> Self {
        Self {
            span,
            content: content.into(),
        }
    }

    pub fn insertion(at: usize, content: impl Into<String>) -> Self {
        Self::new(at..at, content)
    }

    pub fn deletion(span: Range<usize>) -> Self {
        Self::new(span, String::new())
    }

    /// Smallest change turning `before` into `after` (common prefix and suffix stripped)
    pub fn from_diff(before: &str, after: &str) -> Self {
        let old: Vec<char> = before.chars().collect();
        let new: Vec<char> = after.chars().collect();

        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        Self {
            span: prefix..old.len() - suffix,
            content: new[prefix..new.len() - suffix].iter().collect(),
        }
    }

    /// Removes existing text
    pub fn is_deletion(&self) -> bool {
        !self.span.is_empty()
    }

    /// Adds new text
    pub fn is_insertion(&self) -> bool {
        !self.content.is_empty()
    }

    /// Effectively a no-op
    pub fn is_empty(&self) -> bool {
        !self.is_deletion() && !self.is_insertion()
    }

    /// Span clamped to a text of `len` characters, never inverted
    pub fn clamped(&self, len: usize) -> Range<usize> {
        let start = self.span.start.min(len);
        let end = self.span.end.clamp(start, len);
        start..end
    }

    /// Apply to `text`, clamping out-of-range spans instead of panicking
    pub fn apply(&self, text: &str) -> String {
        let len = text.chars().count();
        let span = self.clamped(len);

        let mut out = String::with_capacity(text.len() + self.content.len());
        out.extend(text.chars().take(span.start));
        out.push_str(&self.content);
        out.extend(text.chars().skip(span.end));
        out
    }

    /// Character count of the replacement
    pub fn content_len(&self) -> usize {
        self.content.chars().count()
    }
}
