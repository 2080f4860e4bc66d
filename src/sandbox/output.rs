use bytes::{Bytes, BytesMut};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Collects combined stdout/stderr up to a byte cap.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: BytesMut,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(8192)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > remaining {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
    }

    pub fn finish(self) -> CapturedOutput {
        CapturedOutput {
            bytes: self.buf.freeze(),
            truncated: self.truncated,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub bytes: Bytes,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Decodes the capture for the caller, dropping control characters so
    /// terminal escape sequences never reach whoever renders the output.
    pub fn render(&self) -> String {
        let mut text = sanitize(&self.bytes);
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Strips C0/C1 control characters and DEL, keeping newlines and tabs.
pub fn sanitize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}
