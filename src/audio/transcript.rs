//! Transcript accumulator for the current turn.

use parking_lot::Mutex;
use std::sync::Arc;

/// Shared between the recognizer (writer) and the coordinator (reader).
pub type SharedTranscript = Arc<Mutex<TranscriptBuffer>>;

/// Finalized recognizer text plus the latest interim fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptBuffer {
    finalized: String,
    interim: String,
}

impl TranscriptBuffer {
    pub fn shared() -> SharedTranscript {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Append a final result. The interim fragment it supersedes is cleared.
    pub fn push_final(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            if !self.finalized.is_empty() {
                self.finalized.push(' ');
            }
            self.finalized.push_str(text);
        }
        self.interim.clear();
    }

    pub fn set_interim(&mut self, text: &str) {
        self.interim = text.trim().to_string();
    }

    pub fn clear(&mut self) {
        self.finalized.clear();
        self.interim.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty() && self.interim.is_empty()
    }

    /// Finalized text followed by any pending interim fragment, trimmed.
    pub fn text(&self) -> String {
        match (self.finalized.is_empty(), self.interim.is_empty()) {
            (_, true) => self.finalized.clone(),
            (true, false) => self.interim.clone(),
            (false, false) => format!("{} {}", self.finalized, self.interim),
        }
    }

    /// Read the text and clear the buffer.
    pub fn take(&mut self) -> String {
        let text = self.text();
        self.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finals_are_joined_and_interim_appended() {
        let mut buf = TranscriptBuffer::default();
        buf.push_final("  I managed ");
        buf.set_interim("a team");
        assert_eq!(buf.text(), "I managed a team");

        buf.push_final("a team of five");
        assert_eq!(buf.text(), "I managed a team of five");
    }

    #[test]
    fn take_clears() {
        let mut buf = TranscriptBuffer::default();
        buf.set_interim("um");
        assert_eq!(buf.take(), "um");
        assert!(buf.is_empty());
        assert_eq!(buf.text(), "");
    }

    #[test]
    fn blank_finals_are_ignored() {
        let mut buf = TranscriptBuffer::default();
        buf.push_final("   ");
        assert!(buf.is_empty());
    }
}
