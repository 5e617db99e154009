/// Incremental UTF-8 decoder for byte chunks cut at arbitrary offsets.
///
/// A multi-byte character split across two chunks is held back until the rest of it
/// arrives. Byte sequences that can never become valid UTF-8 are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `chunk` as possible, carrying an incomplete trailing sequence.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut decoded = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    break;
                }
                Err(error) => {
                    let (valid, tail) = rest.split_at(error.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        decoded.push_str(valid);
                    }

                    match error.error_len() {
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[invalid_len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushes a dangling partial character as U+FFFD.
    pub fn finish(&mut self) -> Option<char> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.clear();
        Some(char::REPLACEMENT_CHARACTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_character_is_reassembled() {
        let text = "naïve 日本";
        let bytes = text.as_bytes();

        for split_at in 0..=bytes.len() {
            let mut decoder = Utf8ChunkDecoder::new();
            let mut decoded = decoder.decode(&bytes[..split_at]);
            decoded.push_str(&decoder.decode(&bytes[split_at..]));

            assert_eq!(decoded, text, "split at byte {split_at}");
            assert_eq!(decoder.pending_len(), 0);
        }
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut decoder = Utf8ChunkDecoder::new();
        let decoded = decoder.decode(&[b'a', 0xFF, b'b']);

        assert_eq!(decoded, "a\u{FFFD}b");
    }

    #[test]
    fn dangling_prefix_is_reported_on_finish() {
        let mut decoder = Utf8ChunkDecoder::new();
        let decoded = decoder.decode(&[b'x', 0xE6, 0x97]);

        assert_eq!(decoded, "x");
        assert_eq!(decoder.pending_len(), 2);
        assert_eq!(decoder.finish(), Some(char::REPLACEMENT_CHARACTER));
        assert_eq!(decoder.finish(), None);
    }
}
