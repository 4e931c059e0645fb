use crate::Buffer::RingBuffer;
use crate::Core::pool::{FreeListCtrl, SharedPool};
use crate::Core::SharedMemory::SharedSegment;
use crate::Queue::handle::QueueCore;
use std::fmt;
use std::sync::atomic::Ordering;

/// Debug function for SharedSegment
///
/// Shows the OS name, mapping address and size, and the live usage count
/// read from the header. Never dereferences the data area.
pub fn debug_shared_segment(segment: &SharedSegment, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedSegment")
        .field("name", &segment.name())
        .field("base", &format_args!("{:p}", segment.backend().as_ptr()))
        .field("mapped", &segment.backend().size())
        .field("data_size", &segment.data_size())
        .field("usage", &segment.usage_count())
        .field("created", &segment.created())
        .finish()
}

/// Debug function for SharedPool
///
/// Shows:
/// - Pool and segment names
/// - Header pointer location
/// - Per-kind free list bookkeeping
pub fn debug_shared_pool(pool: &SharedPool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let header = unsafe { &*pool.header_ptr() };
    f.debug_struct("SharedPool")
        .field("name", &pool.name())
        .field("segment", &pool.segment_name())
        .field("header", &format_args!("{:p}", pool.header_ptr()))
        .field("initialized", &pool.is_initialized())
        .field("processes", &pool.attached_processes())
        .field("semaphores", &header.semaphores)
        .field("mutexes", &header.mutexes)
        .finish()
}

pub fn debug_free_list(ctrl: &FreeListCtrl, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FreeList")
        .field("capacity", &ctrl.capacity.load(Ordering::Relaxed))
        .field("head", &ctrl.head.load(Ordering::Relaxed))
        .field("curr_used", &ctrl.curr_used.load(Ordering::Relaxed))
        .field("max_used", &ctrl.max_used.load(Ordering::Relaxed))
        .finish()
}

/// Debug function for RingBuffer
///
/// Cursor state only; the stored bytes are not printed.
pub fn debug_ring_buffer(buffer: &RingBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = buffer.inner.lock();
    f.debug_struct("RingBuffer")
        .field("capacity", &buffer.capacity)
        .field("head", &state.head)
        .field("tail", &state.tail)
        .field("used", &state.used)
        .finish()
}

pub(crate) fn debug_queue_core(kind: &str, core: &QueueCore, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let ctrl = core.ctrl();
    let spec = core.spec();
    let mut s = f.debug_struct(kind);
    s.field("queue_id", &spec.queue_id)
        .field("mode", &core.mode())
        .field("slot_size", &spec.slot_size)
        .field("slot_count", &spec.slot_count)
        .field("head", &ctrl.head.load(Ordering::Relaxed))
        .field("tail", &ctrl.tail.load(Ordering::Relaxed))
        .field("messages", &core.messages())
        .field("readers", &ctrl.readers.load(Ordering::Relaxed))
        .field("writers", &ctrl.writers.load(Ordering::Relaxed));
    if let Some(segment) = core.segment_name() {
        s.field("segment", &segment);
    }
    s.finish()
}
