//! Incremental newline splitter for raw process output.
//!
//! Stdout arrives in arbitrary byte chunks: a record may be split mid-line,
//! or even mid-character. The splitter keeps the unterminated tail across
//! calls and only yields a line once its `\n` has arrived.

#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line completed by it, in order.
    ///
    /// Line terminators (`\n` and a preceding `\r`) are stripped. Invalid
    /// UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(Self::decode(&self.pending));
            self.pending.clear();
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Take the unterminated tail, if it holds anything but whitespace.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending);
        let line = Self::decode(&tail);
        if line.trim().is_empty() { None } else { Some(line) }
    }

    /// Bytes buffered since the last complete line.
    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn decode(bytes: &[u8]) -> String {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_lines_in_one_chunk() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"one\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn test_line_split_across_chunks_is_emitted_once() {
        let record = br#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let mut full = record.to_vec();
        full.push(b'\n');

        for offset in 1..full.len() {
            let mut splitter = LineSplitter::new();
            let first = splitter.push(&full[..offset]);
            let second = splitter.push(&full[offset..]);
            let all: Vec<String> = first.into_iter().chain(second).collect();
            assert_eq!(all.len(), 1, "offset {}", offset);
            assert_eq!(all[0].as_bytes(), record, "offset {}", offset);
        }
    }

    #[test]
    fn test_multibyte_character_split_between_chunks() {
        let text = "héllo\n".as_bytes();
        // Split inside the two-byte 'é'
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&text[..2]).is_empty());
        let lines = splitter.push(&text[2..]);
        assert_eq!(lines, vec!["héllo"]);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"a\r\nb\r\n"), vec!["a", "b"]);
    }

    #[test]
    fn test_finish_returns_unterminated_tail() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"done\n{\"type\":\"res"), vec!["done"]);
        assert_eq!(splitter.push(b"ult\"}"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some(r#"{"type":"result"}"#));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_finish_ignores_whitespace_tail() {
        let mut splitter = LineSplitter::new();
        splitter.push(b"x\n  ");
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_empty_lines_are_preserved() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"\n\nx\n"), vec!["", "", "x"]);
    }
}
