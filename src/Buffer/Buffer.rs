// Byte-oriented circular buffer. Record framing is layered on top of it by
// callers; the message queues reuse its wraparound copy helpers over slot
// storage that lives in shared memory.

use parking_lot::Mutex;

/// Fixed-capacity circular byte buffer guarded by a single mutex.
///
/// `head` is where the next write lands, `tail` is the oldest unconsumed
/// byte. Both are kept modulo capacity; `used == 0` means empty whatever
/// their values are.
pub struct RingBuffer {
    pub(crate) inner: Mutex<RingState>,
    pub(crate) capacity: usize,
}

pub(crate) struct RingState {
    pub(crate) data: Box<[u8]>,
    pub(crate) head: usize,
    pub(crate) tail: usize,
    pub(crate) used: usize,
}
