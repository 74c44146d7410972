/// Turns a stream of text (or raw bytes) into complete, trimmed lines.
///
/// Whatever follows the last newline is kept as carry-over until the next chunk arrives.
/// Bytes are buffered undecoded, so a multi-byte UTF-8 sequence that is split between two
/// chunks still decodes correctly once its line is complete.
#[derive(Debug, Default, Clone)]
pub struct LineFramer {
    carry: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.feed_bytes(chunk.as_bytes())
    }

    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.carry[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            // `\r` is whitespace, so trimming takes care of `\r\n`
            push_trimmed(&mut lines, &self.carry[start..end]);
            start = end + 1;
        }

        self.carry.drain(..start);
        lines
    }

    /// Flushes the carry-over as a final line. Called when the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.carry);
        let mut lines = Vec::with_capacity(1);
        push_trimmed(&mut lines, &rest);
        lines.pop()
    }

    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }
}

fn push_trimmed(lines: &mut Vec<String>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(framer.feed_bytes(chunk));
        }
        lines.extend(framer.finish());
        lines
    }

    #[test]
    fn splits_lines_and_keeps_carry_over() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed("Lamp=ON Bri"), Vec::<String>::new());
        assert!(framer.has_pending());
        assert_eq!(framer.feed("ghtness=42\r\nPattern 1/"), vec!["Lamp=ON Brightness=42"]);
        assert_eq!(framer.feed("3 'Konstant'\n"), vec!["Pattern 1/3 'Konstant'"]);
        assert!(!framer.has_pending());
    }

    #[test]
    fn drops_blank_lines_and_trims() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed("\n  \r\n  [Quick]1,2  \n\n"), vec!["[Quick]1,2"]);
    }

    #[test]
    fn finish_flushes_partial_line_once() {
        let mut framer = LineFramer::new();
        assert!(framer.feed("Presence=far").is_empty());
        assert_eq!(framer.finish(), Some("Presence=far".to_string()));
        assert_eq!(framer.finish(), None);

        framer.feed("   ");
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn chunking_does_not_change_the_lines() {
        let stream = b"Lamp=ON Brightness=42.0\r\nPattern 3/12 'Comet'\n\n[Quick]1,4,7\nPresence=near\r\n[Custom] len=4 stepMs=200";
        let expected = vec![
            "Lamp=ON Brightness=42.0",
            "Pattern 3/12 'Comet'",
            "[Quick]1,4,7",
            "Presence=near",
            "[Custom] len=4 stepMs=200",
        ];

        assert_eq!(frame_all(&[stream]), expected);

        for size in 1..stream.len() {
            let chunks: Vec<&[u8]> = stream.chunks(size).collect();
            assert_eq!(frame_all(&chunks), expected, "chunk size {}", size);
        }

        for split in 0..stream.len() {
            let (a, b) = stream.split_at(split);
            assert_eq!(frame_all(&[a, b]), expected, "split at {}", split);
        }
    }

    #[test]
    fn multibyte_sequence_split_across_chunks() {
        let text = "Pattern 4/9 'Glühwürmchen'\n".as_bytes();
        let cut = text.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut framer = LineFramer::new();
        assert!(framer.feed_bytes(&text[..cut]).is_empty());
        assert_eq!(framer.feed_bytes(&text[cut..]), vec!["Pattern 4/9 'Glühwürmchen'"]);
    }
}
