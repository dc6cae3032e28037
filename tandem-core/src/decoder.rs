//! Incremental UTF-8 reassembly for token byte fragments.

/// Token output stream for incremental decoding.
///
/// Single tokens often carry part of a multi-byte character. The decoder
/// holds back an incomplete trailing sequence until the bytes that complete
/// it arrive. Invalid sequences become U+FFFD the same way
/// [`String::from_utf8_lossy`] replaces them, so the concatenation of every
/// chunk plus [`finish`](Self::finish) equals a one-shot lossy decode of all
/// fragments.
#[derive(Debug, Default)]
pub struct StreamingDecoder {
    pending: Vec<u8>,
}

impl StreamingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the text that became complete, if any.
    pub fn next_fragment(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    // Prefix is valid UTF-8 by construction
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Flush whatever is still buffered, lossily.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
