//! Incremental line decoding for streamed backend output.
//!
//! Network reads and pipe reads split data at arbitrary byte offsets, so a
//! line (or a multi-byte UTF-8 character) may arrive over several chunks.
//! The decoder buffers raw bytes and only yields lines once their newline
//! has been seen.

use tracing::trace;

/// Byte-level line decoder.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    ///
    /// Trailing `\r` is stripped; empty lines are returned as empty strings
    /// because SSE uses them as event separators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(Self::to_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);

        trace!(lines = lines.len(), pending = self.buffer.len(), "Decoded chunk");
        lines
    }

    /// Flush the trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = Self::to_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn to_line(bytes: &[u8]) -> String {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_line_is_buffered() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"type\":\"st").is_empty());
        assert_eq!(decoder.pending(), 11);

        let lines = decoder.push(b"ep\"}\n{\"a\":1}\n{\"b\"");
        assert_eq!(lines, vec!["{\"type\":\"step\"}", "{\"a\":1}"]);
        assert_eq!(decoder.finish().as_deref(), Some("{\"b\""));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"data: x\r\n\r\n");
        assert_eq!(lines, vec!["data: x", ""]);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let text = "étape\n".as_bytes();
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&text[..1]).is_empty());
        assert_eq!(decoder.push(&text[1..]), vec!["étape"]);
    }
}
