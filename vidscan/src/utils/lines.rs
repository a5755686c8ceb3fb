//! Line reading for child process output.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Newline-delimited reader that decodes each line lossily.
///
/// Child processes may print arbitrary bytes. A line that is not valid UTF-8
/// comes back with replacement characters instead of ending the stream, so
/// the pipe keeps being drained until EOF.
pub struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LossyLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8]) -> Vec<String> {
        let mut lines = LossyLines::new(input);
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let lines = collect(b"STAGE:ai\ngarbage \xff\xfe line\nPROGRESS:1\n").await;
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("garbage "));
        assert_eq!(lines[2], "PROGRESS:1");
    }

    #[tokio::test]
    async fn strips_terminators_and_keeps_the_last_partial_line() {
        let lines = collect(b"a\r\nb\n\nc").await;
        assert_eq!(lines, ["a", "b", "", "c"]);
    }
}
