use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bounded tail of a process's stderr.
///
/// Holds at most `max_lines` lines of at most `max_line_len` bytes each, so
/// a chatty or runaway process cannot grow memory without limit.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    max_lines: usize,
    max_line_len: usize,
    dropped: usize,
    pending: Vec<u8>,
}

impl DiagnosticTail {
    pub fn new(max_lines: usize, max_line_len: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.max(1)),
            max_lines: max_lines.max(1),
            max_line_len: max_line_len.max(16),
            dropped: 0,
            pending: Vec::new(),
        }
    }

    /// Feed raw bytes; `\r` and `\n` both end a line since ffmpeg redraws progress with `\r`
    pub fn extend(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                b'\r' | b'\n' => self.flush_pending(),
                other => {
                    if self.pending.len() < self.max_line_len {
                        self.pending.push(other);
                    }
                }
            }
        }
    }

    pub fn push_line<S: AsRef<str>>(&mut self, line: S) {
        let line = line.as_ref().trim_end();
        if line.is_empty() {
            return;
        }
        let mut line = line.to_string();
        if line.len() > self.max_line_len {
            let mut cut = self.max_line_len;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        self.push_line(line);
    }

    /// Close out a trailing partial line
    pub fn finish(&mut self) {
        self.flush_pending();
    }

    /// Number of lines that fell out of the buffer
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|s| s.as_str())
    }

    /// Last line that looks like an error, falling back to the last line
    pub fn headline(&self) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .find(|line| {
                let lower = line.to_ascii_lowercase();
                lower.contains("error") || lower.contains("invalid") || lower.contains("no such file")
            })
            .or_else(|| self.lines.back())
            .map(|s| s.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("[{} earlier lines omitted]\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    /// Read a stream to EOF into a fresh tail
    pub async fn capture<R>(mut reader: R, max_lines: usize, max_line_len: usize) -> Self
    where
        R: AsyncRead + Unpin,
    {
        let mut tail = Self::new(max_lines, max_line_len);
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.extend(&buf[..n]),
            }
        }
        tail.finish();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_only_last_lines() {
        let mut tail = DiagnosticTail::new(3, 64);
        for i in 0..10 {
            tail.push_line(format!("line {}", i));
        }
        assert_eq!(tail.lines().collect::<Vec<_>>(), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(tail.dropped(), 7);
        assert!(tail.render().starts_with("[7 earlier lines omitted]"));
    }

    #[test]
    fn test_splits_on_carriage_returns() {
        let mut tail = DiagnosticTail::new(10, 64);
        tail.extend(b"frame=1\rframe=2\r");
        tail.extend(b"clip.mp4: No such file or directory\nlast partial");
        tail.finish();

        let lines: Vec<_> = tail.lines().collect();
        assert_eq!(lines, vec!["frame=1", "frame=2", "clip.mp4: No such file or directory", "last partial"]);
        assert_eq!(tail.headline(), Some("clip.mp4: No such file or directory"));
    }

    #[test]
    fn test_truncates_long_lines() {
        let mut tail = DiagnosticTail::new(2, 16);
        tail.extend(&[b'x'; 1000]);
        tail.extend(b"\n");
        assert_eq!(tail.lines().next().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_capture_from_reader() {
        let data: &[u8] = b"a\nb\nc\n";
        let tail = DiagnosticTail::capture(data, 2, 64).await;
        assert_eq!(tail.lines().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
