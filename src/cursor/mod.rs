//! Presence: where every member's cursor is.
//!
//! Cursor state is ephemeral and replicated last-writer-wins per member,
//! ordered by a Lamport timestamp carried in each update.

mod controller;

pub use controller::{CursorController, MAX_TIMESTAMP};

use serde::{Deserialize, Serialize};
use std::ops::Range;
use uuid::Uuid;

/// Cursor or selection of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Buffer path the cursor is in
    pub buffer: String,
    /// Selection start (character offset)
    pub start: usize,
    /// Selection end (character offset), equal to `start` for a caret
    pub end: usize,
    /// Lamport timestamp; higher wins
    pub timestamp: u64,
}

impl CursorState {
    /// A cursor spanning `start..end`, normalized so that `start <= end`
    pub fn new(buffer: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            buffer: buffer.into(),
            start: start.min(end),
            end: start.max(end),
            timestamp: 0,
        }
    }

    pub fn caret(buffer: impl Into<String>, at: usize) -> Self {
        Self::new(buffer, at, at)
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn has_selection(&self) -> bool {
        self.start != self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// One member's cursor moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub user: Uuid,
    pub state: CursorState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_normalizes_selection() {
        let cursor = CursorState::new("main.rs", 10, 4);
        assert_eq!(cursor.range(), 4..10);
        assert!(cursor.has_selection());

        let caret = CursorState::caret("main.rs", 3);
        assert!(!caret.has_selection());
        assert_eq!(caret.timestamp, 0);
    }
}
