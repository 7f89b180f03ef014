//! Fixed-duration chunk assembly
//!
//! Accumulates mono PCM bytes and cuts them into equal-sized chunks, one per
//! binary WebSocket frame. The remainder is carried until the next push; on
//! flush it is zero-padded so every frame the server sees has the same
//! duration.

/// Byte accumulator emitting fixed-size chunks
pub struct Chunker {
    chunk_bytes: usize,
    buf: Vec<u8>,
}

impl Chunker {
    /// `chunk_bytes` is `target_rate * chunk_ms / 1000 * 2` for int16 mono
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes,
            buf: Vec::with_capacity(chunk_bytes * 2),
        }
    }

    /// Append bytes, returning every complete chunk crossed by this push
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while self.buf.len() >= self.chunk_bytes {
            let rest = self.buf.split_off(self.chunk_bytes);
            chunks.push(std::mem::replace(&mut self.buf, rest));
        }
        chunks
    }

    /// Zero-pad and emit the remainder at end of input, if any
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let mut chunk = std::mem::take(&mut self.buf);
        chunk.resize(self.chunk_bytes, 0);
        Some(chunk)
    }

    /// Bytes currently carried below one chunk boundary
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
