//! Packet buffer with head reserve and tail room.
//!
//! Messages are encoded in place: the payload sits after a reserved head
//! region into which the header is written, and the integrity trailer is
//! appended into the tail room.

use crate::WireError;

/// Head reserve large enough for a length prefix and the longest header
pub const DEFAULT_HEADER_RESERVE: usize = 32;
/// Tail room large enough for the longest trailer
pub const DEFAULT_TRAILER_RESERVE: usize = 32;

/// Fixed-capacity byte buffer with a movable data window
#[derive(Clone, PartialEq, Eq)]
pub struct PacketBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl PacketBuffer {
    /// Empty buffer of `capacity` bytes whose data window starts after `reserve`
    pub fn with_capacity(capacity: usize, reserve: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            start: reserve.min(capacity),
            len: 0,
        }
    }

    /// Buffer holding `payload` with the given head reserve and tail room
    pub fn from_payload(payload: &[u8], head_reserve: usize, tail_room: usize) -> Self {
        let mut storage = vec![0; head_reserve + payload.len() + tail_room];
        storage[head_reserve..head_reserve + payload.len()].copy_from_slice(payload);
        Self {
            storage,
            start: head_reserve,
            len: payload.len(),
        }
    }

    /// Buffer with default reserves for an outbound payload
    pub fn for_payload(payload: &[u8]) -> Self {
        Self::from_payload(payload, DEFAULT_HEADER_RESERVE, DEFAULT_TRAILER_RESERVE)
    }

    /// Buffer holding received bytes with no reserve
    pub fn from_received(data: &[u8]) -> Self {
        Self::from_payload(data, 0, 0)
    }

    /// Offset of the data window, equal to the reserved head size
    pub fn start(&self) -> usize {
        self.start
    }

    /// Bytes available in front of the data window
    pub fn reserved_head(&self) -> usize {
        self.start
    }

    /// Length of the data window
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the data window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size of the underlying storage
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes available after the data window
    pub fn available_tail(&self) -> usize {
        self.storage.len() - self.start - self.len
    }

    /// Largest data window possible without moving the start
    pub fn max_data_len(&self) -> usize {
        self.storage.len() - self.start
    }

    /// Current data window
    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    /// Current data window, mutable
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    /// Set the data window length, keeping the start
    pub fn set_len(&mut self, len: usize) -> Result<(), WireError> {
        if len > self.max_data_len() {
            return Err(WireError::BufferTooSmall);
        }
        self.len = len;
        Ok(())
    }

    /// Place the data window at `start` with `len` bytes
    pub fn set_window(&mut self, start: usize, len: usize) -> Result<(), WireError> {
        if start.checked_add(len).map_or(true, |end| end > self.storage.len()) {
            return Err(WireError::BufferTooSmall);
        }
        self.start = start;
        self.len = len;
        Ok(())
    }

    /// Move the start back by `n` bytes, exposing part of the head reserve
    pub fn grow_front(&mut self, n: usize) -> Result<(), WireError> {
        if n > self.start {
            return Err(WireError::BufferTooSmall);
        }
        self.start -= n;
        self.len += n;
        Ok(())
    }

    /// Move the start forward by `n` bytes, dropping them from the window
    pub fn shrink_front(&mut self, n: usize) -> Result<(), WireError> {
        if n > self.len {
            return Err(WireError::InvalidMessageLength);
        }
        self.start += n;
        self.len -= n;
        Ok(())
    }

    /// Fail unless `n` bytes of tail room are available
    pub fn ensure_tail_capacity(&self, n: usize) -> Result<(), WireError> {
        if self.available_tail() < n {
            return Err(WireError::BufferTooSmall);
        }
        Ok(())
    }

    /// Fail unless `n` bytes of head reserve are available
    pub fn ensure_head_reserve(&self, n: usize) -> Result<(), WireError> {
        if self.start < n {
            return Err(WireError::BufferTooSmall);
        }
        Ok(())
    }

    /// Append bytes into the tail room
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.ensure_tail_capacity(bytes.len())?;
        let end = self.start + self.len;
        self.storage[end..end + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Bytes between the data window and the end of storage
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let end = self.start + self.len;
        &mut self.storage[end..]
    }

    /// Copy the first `n` bytes into a new buffer and drop them from this one
    pub fn split_to(&mut self, n: usize) -> Result<PacketBuffer, WireError> {
        if n > self.len {
            return Err(WireError::MessageIncomplete);
        }
        let head = PacketBuffer::from_received(&self.data()[..n]);
        self.shrink_front(n)?;
        Ok(head)
    }

    /// Move the data window to the front of storage, freeing tail room
    pub fn compact(&mut self) {
        if self.start > 0 {
            self.storage.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
    }

    /// Drop all data and reset the start to zero
    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_arithmetic() {
        let mut buf = PacketBuffer::from_payload(b"abc", 4, 2);
        assert_eq!(buf.reserved_head(), 4);
        assert_eq!(buf.available_tail(), 2);
        assert_eq!(buf.capacity(), 9);

        buf.grow_front(4).unwrap();
        assert_eq!(buf.len(), 7);
        assert!(buf.grow_front(1).is_err());

        buf.shrink_front(4).unwrap();
        assert_eq!(buf.data(), b"abc");
        assert!(buf.shrink_front(4).is_err());
    }

    #[test]
    fn test_tail_operations() {
        let mut buf = PacketBuffer::from_payload(b"ab", 0, 2);
        buf.extend_from_slice(b"cd").unwrap();
        assert_eq!(buf.data(), b"abcd");
        assert_eq!(buf.extend_from_slice(b"e"), Err(WireError::BufferTooSmall));
        assert!(buf.set_len(5).is_err());
        buf.set_len(1).unwrap();
        assert_eq!(buf.data(), b"a");

        buf.set_window(1, 3).unwrap();
        assert_eq!(buf.data(), b"bcd");
        assert_eq!(buf.set_window(3, 2), Err(WireError::BufferTooSmall));
        assert_eq!(buf.data(), b"bcd");
    }

    #[test]
    fn test_split_and_compact() {
        let mut buf = PacketBuffer::with_capacity(8, 0);
        buf.extend_from_slice(b"hello").unwrap();

        let head = buf.split_to(2).unwrap();
        assert_eq!(head.data(), b"he");
        assert_eq!(buf.data(), b"llo");
        assert_eq!(buf.split_to(4), Err(WireError::MessageIncomplete));

        buf.compact();
        assert_eq!(buf.start(), 0);
        assert_eq!(buf.available_tail(), 5);
        assert_eq!(buf.data(), b"llo");
    }
}
