//! Token-to-chunk buffering
//!
//! Groups streamed tokens into speakable chunks for TTS feeding. Chunks
//! break on sentence punctuation, or on any whitespace once a chunk has
//! grown past the soft limit, so long unpunctuated responses still flow.

/// Buffers tokens and yields speakable chunks
pub struct SentenceBuffer {
    pending: String,
    /// Prefer breaking after this many characters even without punctuation
    soft_limit: usize,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            soft_limit: 120,
        }
    }

    pub fn with_soft_limit(mut self, limit: usize) -> Self {
        self.soft_limit = limit.max(1);
        self
    }

    /// Add a token; returns any chunks that became complete
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.pending.push_str(token);

        let mut chunks = Vec::new();
        loop {
            let Some(break_at) = self.find_break() else {
                break;
            };
            let chunk: String = self.pending.drain(..break_at).collect();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
        }
        chunks
    }

    fn find_break(&self) -> Option<usize> {
        // Sentence punctuation followed by whitespace (or buffered further
        // text) is a natural break.
        let mut chars = self.pending.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            if matches!(ch, '.' | '!' | '?') {
                if let Some((_, next)) = chars.peek() {
                    if next.is_whitespace() {
                        return Some(idx + ch.len_utf8());
                    }
                }
            }
        }

        // Past the soft limit, break on the last whitespace.
        if self.pending.chars().count() > self.soft_limit {
            let break_at = self
                .pending
                .char_indices()
                .filter(|(_, c)| c.is_whitespace())
                .map(|(i, _)| i)
                .last()?;
            if break_at > 0 {
                return Some(break_at);
            }
        }
        None
    }

    /// Drain whatever remains
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Whether anything is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.trim().is_empty()
    }
}

impl Default for SentenceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_break() {
        let mut buf = SentenceBuffer::new();
        assert!(buf.push("Hello").is_empty());
        assert!(buf.push(" there.").is_empty());
        let chunks = buf.push(" How are you?");
        assert_eq!(chunks, vec!["Hello there.".to_string()]);

        assert_eq!(buf.flush(), Some("How are you?".to_string()));
        assert!(buf.flush().is_none());
    }

    #[test]
    fn test_soft_limit_breaks_on_whitespace() {
        let mut buf = SentenceBuffer::new().with_soft_limit(10);
        let chunks = buf.push("twelve letter words keep flowing");
        assert!(!chunks.is_empty());
        // Nothing is lost between chunks and the remainder.
        let mut all = chunks.join(" ");
        if let Some(rest) = buf.flush() {
            all.push(' ');
            all.push_str(&rest);
        }
        assert_eq!(all, "twelve letter words keep flowing");
    }

    #[test]
    fn test_abbreviation_like_token_stream() {
        let mut buf = SentenceBuffer::new();
        // A trailing period with no following whitespace stays buffered.
        assert!(buf.push("See you at 3 p.m").is_empty());
        assert!(buf.push(".").is_empty());
        assert_eq!(buf.flush(), Some("See you at 3 p.m.".to_string()));
    }
}
