use crate::config::PublicQueueDef;
use crate::Core::SharedMemory::align_up;
use crate::Synch::{RawMutex, RawSemaphore};
use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32};

/// Free-list terminator: the list is exhausted.
pub const FREE_LIST_END: i32 = -1;
/// `next_free` value of a slot that is handed out.
pub const ALLOCATED: i32 = -2;

/// Maximum public queue name length, including the terminating zero.
pub const QUEUE_NAME_LEN: usize = 64;

pub const POOL_VERSION: u32 = 1;

/// Bookkeeping for one array of primitives. Mutated only under the
/// segment header mutex; read lock-free for statistics.
#[repr(C)]
pub struct FreeListCtrl {
    pub capacity: AtomicI32,
    /// 0-based index of the first free slot, or `FREE_LIST_END`.
    pub head: AtomicI32,
    pub curr_used: AtomicI64,
    pub max_used: AtomicI64,
}

/// Start of the pool's data area.
///
/// `initialized` is stored with Release only after the arrays, the free
/// lists and the queue table are fully written; readers load it with
/// Acquire before touching any of them.
#[repr(C, align(128))]
pub struct PoolHeader {
    pub initialized: AtomicU32,
    pub version: AtomicU32,
    pub queue_defs: AtomicU32,
    pub _reserved: u32,
    pub semaphores: FreeListCtrl,
    pub mutexes: FreeListCtrl,
}

/// A public queue definition as stored in shared memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueueDefEntry {
    pub queue_id: i32,
    pub slot_size: u32,
    pub slot_count: u32,
    pub multiple_readers: u8,
    pub multiple_writers: u8,
    pub name_len: u16,
    pub name: [u8; QUEUE_NAME_LEN],
}

impl QueueDefEntry {
    pub fn from_def(def: &PublicQueueDef) -> Self {
        let mut name = [0u8; QUEUE_NAME_LEN];
        let bytes = def.name.as_bytes();
        let len = bytes.len().min(QUEUE_NAME_LEN - 1);
        name[..len].copy_from_slice(&bytes[..len]);
        Self {
            queue_id: def.queue_id,
            slot_size: def.slot_size as u32,
            slot_count: def.slot_count as u32,
            multiple_readers: def.multiple_readers as u8,
            multiple_writers: def.multiple_writers as u8,
            name_len: len as u16,
            name,
        }
    }

    pub fn to_def(&self) -> PublicQueueDef {
        let len = (self.name_len as usize).min(QUEUE_NAME_LEN);
        PublicQueueDef {
            queue_id: self.queue_id,
            name: String::from_utf8_lossy(&self.name[..len]).into_owned(),
            slot_size: self.slot_size as usize,
            slot_count: self.slot_count as usize,
            multiple_readers: self.multiple_readers != 0,
            multiple_writers: self.multiple_writers != 0,
        }
    }
}

/// Byte offsets of the pool regions inside the segment data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub max_semaphores: usize,
    pub max_mutexes: usize,
    pub queue_defs: usize,
    pub semaphore_offset: usize,
    pub mutex_offset: usize,
    pub queue_offset: usize,
    pub total: usize,
}

impl PoolLayout {
    pub fn new(max_semaphores: usize, max_mutexes: usize, queue_defs: usize) -> Self {
        let semaphore_offset = align_up(size_of::<PoolHeader>());
        let mutex_offset = align_up(semaphore_offset + max_semaphores * size_of::<RawSemaphore>());
        let queue_offset = align_up(mutex_offset + max_mutexes * size_of::<RawMutex>());
        let total = align_up(queue_offset + queue_defs * size_of::<QueueDefEntry>());
        Self {
            max_semaphores,
            max_mutexes,
            queue_defs,
            semaphore_offset,
            mutex_offset,
            queue_offset,
            total,
        }
    }
}
