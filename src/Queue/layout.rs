use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

/// Control block of one queue. Lives on the heap for private queues and at
/// the start of the queue segment for public ones.
///
/// Everything above `head` is written only with the registry mutex held
/// (first open, registration, last close). `head` moves under the write
/// mutex (or by the single writer), `tail` under the read mutex (or by the
/// single reader).
#[repr(C, align(128))]
pub struct QueueCtrl {
    pub initialized: AtomicU32,
    pub queue_id: AtomicI32,
    pub ref_count: AtomicI32,
    pub readers: AtomicI32,
    pub writers: AtomicI32,
    pub multiple_readers: AtomicU32,
    pub multiple_writers: AtomicU32,
    pub slot_size: AtomicU32,
    pub slot_count: AtomicU32,
    /// Pool handles of the synchronization objects (public queues only).
    pub read_mutex: AtomicI32,
    pub write_mutex: AtomicI32,
    pub sem_free: AtomicI32,
    pub sem_msgs: AtomicI32,

    /// Next slot to be written.
    pub head: CachePadded<AtomicU64>,

    /// Oldest slot not yet consumed.
    pub tail: CachePadded<AtomicU64>,
}

impl QueueCtrl {
    pub fn zeroed() -> Self {
        Self {
            initialized: AtomicU32::new(0),
            queue_id: AtomicI32::new(0),
            ref_count: AtomicI32::new(0),
            readers: AtomicI32::new(0),
            writers: AtomicI32::new(0),
            multiple_readers: AtomicU32::new(0),
            multiple_writers: AtomicU32::new(0),
            slot_size: AtomicU32::new(0),
            slot_count: AtomicU32::new(0),
            read_mutex: AtomicI32::new(0),
            write_mutex: AtomicI32::new(0),
            sem_free: AtomicI32::new(0),
            sem_msgs: AtomicI32::new(0),
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

/// Offset of the slot storage from the start of the queue region.
pub const SLOTS_OFFSET: usize =
    crate::Core::SharedMemory::align_up(std::mem::size_of::<QueueCtrl>());
