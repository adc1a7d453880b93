//! Sentence segmentation for delivery
//!
//! CJK terminal punctuation (`。！？`) and newlines end a sentence
//! immediately. Latin `.` `!` `?` end one only when followed by whitespace,
//! which stays with the sentence it ends. All limits count characters, not
//! bytes.

/// Default character budget per delivered batch
pub const DEFAULT_MAX_BATCH_CHARS: usize = 800;

fn is_immediate_boundary(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '\n')
}

fn is_latin_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Byte offset just past the first sentence boundary in `text`
fn next_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if is_immediate_boundary(c) {
            return Some(idx + c.len_utf8());
        }
        if is_latin_terminal(c) {
            if let Some(&(next_idx, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(next_idx + next.len_utf8());
                }
            }
        }
    }
    None
}

/// Byte offset of the `n`th character, or the string length
fn char_offset(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(idx, _)| idx)
}

/// Split text into sentences. The trailing fragment without a boundary is
/// returned as the last element. Concatenating the result yields `text`.
#[must_use]
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut rest = text;
    while let Some(end) = next_boundary(rest) {
        let (sentence, tail) = rest.split_at(end);
        sentences.push(sentence);
        rest = tail;
    }
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn chunk_chars(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let (head, tail) = rest.split_at(char_offset(rest, max_chars));
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}

/// Pack sentences greedily into batches of at most `max_chars` characters.
///
/// A sentence longer than `max_chars` is cut into `max_chars` pieces.
/// Joining the batches reproduces `text` exactly.
#[must_use]
pub fn iter_sentence_batches(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for sentence in split_sentences(text) {
        let len = sentence.chars().count();
        if len > max_chars {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_len = 0;
            }
            batches.extend(chunk_chars(sentence, max_chars));
            continue;
        }
        if current_len + len > max_chars {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(sentence);
        current_len += len;
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Accumulates streamed deltas and releases whole sentences
#[derive(Debug, Clone)]
pub struct SentenceBuffer {
    buffer: String,
    max_chars: usize,
}

impl SentenceBuffer {
    /// Create a buffer that force-flushes at `max_chars` characters
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Add a delta and return the sentences it completed
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut ready = Vec::new();

        while let Some(end) = next_boundary(&self.buffer) {
            let tail = self.buffer.split_off(end);
            ready.push(std::mem::replace(&mut self.buffer, tail));
        }

        while self.buffer.chars().count() >= self.max_chars {
            let end = char_offset(&self.buffer, self.max_chars);
            let tail = self.buffer.split_off(end);
            ready.push(std::mem::replace(&mut self.buffer, tail));
        }

        ready
    }

    /// Characters waiting for a boundary
    #[must_use]
    pub fn pending_chars(&self) -> usize {
        self.buffer.chars().count()
    }

    /// Release whatever is left at end of stream
    #[must_use]
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_mixed_punctuation() {
        assert_eq!(
            split_sentences("你好，世界。Hello there. Bye!"),
            vec!["你好，世界。", "Hello there. ", "Bye!"]
        );
    }

    #[test]
    fn test_latin_terminal_needs_whitespace() {
        assert_eq!(split_sentences("v1.2 is out"), vec!["v1.2 is out"]);
        assert_eq!(split_sentences("a\nb"), vec!["a\n", "b"]);
    }

    #[test]
    fn test_batches_pack_sentences() {
        let s1 = format!("{}。", "甲".repeat(390));
        let s2 = format!("{}。", "乙".repeat(390));
        let s3 = format!("{}。", "丙".repeat(390));
        let text = format!("{s1}{s2}{s3}");

        let batches = iter_sentence_batches(&text, DEFAULT_MAX_BATCH_CHARS);
        assert_eq!(batches, vec![format!("{s1}{s2}"), s3]);
    }

    #[test]
    fn test_long_sentence_is_cut() {
        let sentence = format!("{}。", "A".repeat(20));
        let batches = iter_sentence_batches(&sentence, 10);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches.concat(), sentence);
    }

    #[test]
    fn test_empty_text_has_no_batches() {
        assert!(iter_sentence_batches("", 10).is_empty());
    }

    #[test]
    fn test_buffer_flushes_on_boundaries() {
        let mut buffer = SentenceBuffer::new(DEFAULT_MAX_BATCH_CHARS);
        let mut out = Vec::new();
        for delta in ["你好", "，世界。", "再见", "！"] {
            out.extend(buffer.push(delta));
        }
        assert!(buffer.finish().is_none());
        assert_eq!(out, vec!["你好，世界。", "再见！"]);
    }

    #[test]
    fn test_buffer_waits_for_whitespace_after_period() {
        let mut buffer = SentenceBuffer::new(100);
        assert!(buffer.push("Done.").is_empty());
        assert_eq!(buffer.push(" Next"), vec!["Done. "]);
        assert_eq!(buffer.finish().as_deref(), Some("Next"));
    }

    #[test]
    fn test_buffer_force_flush_without_boundary() {
        let mut buffer = SentenceBuffer::new(4);
        assert_eq!(buffer.push("abcdefghij"), vec!["abcd", "efgh"]);
        assert_eq!(buffer.pending_chars(), 2);
        assert_eq!(buffer.finish().as_deref(), Some("ij"));
    }
}
