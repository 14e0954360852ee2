//! Incremental UTF-8 decoding for byte streams
//!
//! PTY reads and raw stdin reads hand out arbitrary byte chunks, so a
//! multi-byte character can straddle two reads. The decoder holds back an
//! incomplete trailing sequence until the next chunk completes it.

/// Longest possible incomplete UTF-8 tail
const MAX_PENDING: usize = 3;

/// Streaming UTF-8 decoder that never splits a character across chunks
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning every complete character so far
    ///
    /// Invalid sequences are replaced with U+FFFD.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));

                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            if after.len() <= MAX_PENDING {
                                self.pending.extend_from_slice(after);
                            } else {
                                out.push(char::REPLACEMENT_CHARACTER);
                            }
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still pending at end of stream
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// Whether bytes are being held back for the next chunk
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
