use std::ptr;

use super::Buffer::{RingBuffer, RingState};
use crate::error::{IpcError, Result};
use parking_lot::Mutex;

/// Copy `src` into a circular region starting at byte `pos`, wrapping at
/// `capacity`. Returns the position after the last byte written.
///
/// # Safety
/// `base` must be valid for writes of `capacity` bytes, `pos < capacity`
/// and `src.len() <= capacity`.
pub(crate) unsafe fn copy_into_ring(base: *mut u8, capacity: usize, pos: usize, src: &[u8]) -> usize {
    let first = src.len().min(capacity - pos);
    ptr::copy_nonoverlapping(src.as_ptr(), base.add(pos), first);
    if first < src.len() {
        ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
    }
    (pos + src.len()) % capacity
}

/// Copy `dest.len()` bytes out of a circular region starting at `pos`.
/// Returns the position after the last byte read.
///
/// # Safety
/// `base` must be valid for reads of `capacity` bytes, `pos < capacity`
/// and `dest.len() <= capacity`.
pub(crate) unsafe fn copy_from_ring(base: *const u8, capacity: usize, pos: usize, dest: &mut [u8]) -> usize {
    let first = dest.len().min(capacity - pos);
    ptr::copy_nonoverlapping(base.add(pos), dest.as_mut_ptr(), first);
    if first < dest.len() {
        ptr::copy_nonoverlapping(base, dest.as_mut_ptr().add(first), dest.len() - first);
    }
    (pos + dest.len()) % capacity
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                used: 0,
            }),
            capacity,
        }
    }

    /// Discard everything and rewind both cursors.
    pub fn initialize(&self) {
        let mut state = self.inner.lock();
        state.head = 0;
        state.tail = 0;
        state.used = 0;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn free(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Append all of `src`, or nothing if it does not fit.
    pub fn write(&self, src: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        let free = self.capacity - state.used;
        if src.len() > free {
            return Err(IpcError::CapacityExceeded {
                requested: src.len(),
                free,
            });
        }
        if src.is_empty() {
            return Ok(());
        }
        let head = state.head;
        state.head = unsafe { copy_into_ring(state.data.as_mut_ptr(), self.capacity, head, src) };
        state.used += src.len();
        Ok(())
    }

    /// Copy out up to `dest.len()` bytes. With `peek` the bytes stay in the
    /// buffer. Returns the number of bytes copied.
    pub fn read(&self, dest: &mut [u8], peek: bool) -> usize {
        let mut state = self.inner.lock();
        let n = dest.len().min(state.used);
        if n == 0 {
            return 0;
        }
        let next = unsafe { copy_from_ring(state.data.as_ptr(), self.capacity, state.tail, &mut dest[..n]) };
        if !peek {
            state.tail = next;
            state.used -= n;
        }
        n
    }

    pub fn peek(&self, dest: &mut [u8]) -> usize {
        self.read(dest, true)
    }

    /// Drop up to `len` unconsumed bytes without copying them.
    pub fn skip(&self, len: usize) -> usize {
        let mut state = self.inner.lock();
        let n = len.min(state.used);
        if n > 0 {
            state.tail = (state.tail + n) % self.capacity;
            state.used -= n;
        }
        n
    }

    /// Overwrite already-written bytes in place. `offset` counts from the
    /// oldest unconsumed byte; the whole range must be unconsumed data.
    pub fn modify(&self, src: &[u8], offset: usize) -> Result<()> {
        let mut state = self.inner.lock();
        let end = offset + src.len();
        if end > state.used {
            return Err(IpcError::OutOfRange {
                offset,
                end,
                used: state.used,
            });
        }
        if src.is_empty() {
            return Ok(());
        }
        let pos = (state.tail + offset) % self.capacity;
        unsafe { copy_into_ring(state.data.as_mut_ptr(), self.capacity, pos, src) };
        Ok(())
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_ring_buffer(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_write_read() {
        let rb = RingBuffer::new(8);
        rb.write(b"abcdef").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out, false), 4);
        assert_eq!(&out, b"abcd");
        rb.write(b"ghijkl").unwrap();
        assert_eq!(rb.used(), 8);
        let mut all = [0u8; 8];
        assert_eq!(rb.read(&mut all, false), 8);
        assert_eq!(&all, b"efghijkl");
        assert!(rb.is_empty());
    }

    #[test]
    fn modify_patches_a_length_prefix() {
        let rb = RingBuffer::new(16);
        rb.write(&[0, 0]).unwrap();
        rb.write(b"payload").unwrap();
        rb.modify(&(7u16).to_le_bytes(), 0).unwrap();
        let mut prefix = [0u8; 2];
        rb.read(&mut prefix, false);
        assert_eq!(u16::from_le_bytes(prefix), 7);
        assert!(matches!(rb.modify(b"xx", 6), Err(IpcError::OutOfRange { .. })));
    }

    #[test]
    fn ring_helpers_wrap() {
        let mut store = [0u8; 5];
        let pos = unsafe { copy_into_ring(store.as_mut_ptr(), 5, 3, b"wxyz") };
        assert_eq!(pos, 2);
        assert_eq!(&store, b"yz\0wx");
        let mut out = [0u8; 4];
        let pos = unsafe { copy_from_ring(store.as_ptr(), 5, 3, &mut out) };
        assert_eq!(pos, 2);
        assert_eq!(&out, b"wxyz");
    }
}
