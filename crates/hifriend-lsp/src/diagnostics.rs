//! Forwarding server output to the host's log sink.

use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::process::OutputStream;

const CHUNK_SIZE: usize = 8 * 1024;

/// Destination for diagnostic lines (the host's output channel).
pub trait LogSink: Send + Sync {
    fn append_line(&self, line: &str);
}

/// Shared log sink.
pub type SharedLog = Arc<dyn LogSink>;

/// Splits a byte stream into lines as chunks arrive.
///
/// A trailing partial line is held back and prefixed to the next chunk.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(i) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(i + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Return the held partial line, if any, leaving the buffer empty.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Read `stream` to the end, sending each line to `log` with `prefix`.
pub async fn forward_lines(mut stream: OutputStream, log: SharedLog, prefix: &str) {
    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    log.append_line(&format!("{prefix}{line}"));
                }
            }
        }
    }
    if let Some(line) = lines.finish() {
        log.append_line(&format!("{prefix}{line}"));
    }
}

/// Read `stream` to the end and throw the bytes away.
pub async fn drain(mut stream: OutputStream) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}
