//! Output capture and normalization.

/// Shown instead of an empty transcript when a program succeeds silently.
pub const SILENT_SUCCESS: &str = "Program executed successfully with no output.";

pub const TRUNCATED_NOTICE: &str = "[output truncated]";

/// Bounded buffer for a container's combined output stream.
///
/// Bytes past the limit are dropped so the stream can still be drained to EOF.
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.bytes, self.truncated)
    }
}

/// Turn raw container output into the transcript returned to the caller.
///
/// Control bytes and ANSI escape sequences are removed, CRLF becomes LF and
/// trailing whitespace is trimmed. `success` selects the placeholder for a
/// program that printed nothing.
pub fn normalize(raw: &[u8], truncated: bool, success: bool) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\n' | '\t' => out.push(c),
            '\u{1b}' => {
                // CSI: ESC '[' params... final byte in '@'..='~'
                if chars.peek() == Some(&'[') {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
            }
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);

    if truncated {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(TRUNCATED_NOTICE);
    }

    if out.is_empty() && success {
        return SILENT_SUCCESS.to_string();
    }
    out
}
