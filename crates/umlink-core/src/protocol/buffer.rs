//! Receive buffer for accumulating partial reads.
//!
//! Transport deliveries are appended at the back; acceptors consume from the
//! front, after which the remaining bytes are shifted left so the unconsumed
//! data is always one contiguous slice.

use super::{ProtocolError, MAX_BUF_LENGTH};

/// Capacity-bounded byte store owned by the read loop
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
    max_len: usize,
}

impl ReceiveBuffer {
    /// Create a buffer capped at [`MAX_BUF_LENGTH`]
    pub fn new() -> Self {
        Self::with_max_len(MAX_BUF_LENGTH)
    }

    /// Create a buffer with a custom cap
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            data: Vec::new(),
            max_len,
        }
    }

    /// Append a transport delivery.
    ///
    /// Fails with [`ProtocolError::OversizedBuffer`] if the unconsumed total
    /// would exceed the cap; the buffer is left untouched in that case.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        let len = self.data.len() + chunk.len();
        if len > self.max_len {
            return Err(ProtocolError::OversizedBuffer {
                len,
                max: self.max_len,
            });
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Discard the first `count` bytes. Consuming more than is buffered
    /// empties the buffer.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    /// Unconsumed bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of unconsumed bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The cap on unconsumed bytes
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume() {
        let mut buf = ReceiveBuffer::new();
        buf.append(&[1, 2, 3]).unwrap();
        buf.append(&[4, 5]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5]);

        buf.consume(2);
        assert_eq!(buf.as_slice(), &[3, 4, 5]);
        assert_eq!(buf.len(), 3);

        buf.consume(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_cap_is_inclusive() {
        let mut buf = ReceiveBuffer::with_max_len(4);
        buf.append(&[0; 4]).unwrap();
        let err = buf.append(&[0]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OversizedBuffer { len: 5, max: 4 }
        ));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_default_cap() {
        let mut buf = ReceiveBuffer::new();
        assert_eq!(buf.max_len(), 1 << 20);
        buf.append(&vec![0u8; MAX_BUF_LENGTH]).unwrap();
        assert!(buf.append(&[0]).is_err());
    }
}
