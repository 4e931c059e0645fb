use super::handle::{QueueCore, QueueMode, QueueSpec};
use super::Structs::Queue_Structs::ThreadMessage;
use crate::error::Result;
use crate::Core::pool::SharedPool;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub const THREAD_SLOT_SIZE: usize = size_of::<ThreadMessage>();

/// Fixed-slot queue of `ThreadMessage`s feeding one actor. Exactly one
/// reader; writers may be many. Push and pop do not allocate.
pub struct ThreadQueue {
    core: QueueCore,
}

fn thread_spec(queue_id: i32, slot_count: usize) -> QueueSpec {
    QueueSpec {
        queue_id,
        name: "actor".into(),
        slot_size: THREAD_SLOT_SIZE,
        slot_count,
        multiple_readers: false,
        multiple_writers: true,
    }
}

impl ThreadQueue {
    pub fn open_private(queue_id: i32, slot_count: usize, mode: QueueMode) -> Result<Self> {
        let core = QueueCore::open_private(thread_spec(queue_id, slot_count), mode)?;
        Ok(Self { core })
    }

    /// Open (creating on first use) the public thread queue `queue_id`.
    pub fn open_public(queue_id: i32, slot_count: usize, mode: QueueMode) -> Result<Self> {
        Self::open_public_in(&SharedPool::global()?, queue_id, slot_count, mode)
    }

    pub fn open_public_in(
        pool: &Arc<SharedPool>,
        queue_id: i32,
        slot_count: usize,
        mode: QueueMode,
    ) -> Result<Self> {
        let core = QueueCore::open_public(pool, thread_spec(queue_id, slot_count), mode, "threadqueue")?;
        Ok(Self { core })
    }

    pub fn reopen(&self, mode: QueueMode) -> Result<Self> {
        Ok(Self {
            core: self.core.reopen(mode)?,
        })
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut ThreadMessage {
        // Private slot storage is a byte buffer, so slots are accessed unaligned.
        unsafe { self.core.data_ptr().add(index * THREAD_SLOT_SIZE) as *mut ThreadMessage }
    }

    pub fn push(&self, message: ThreadMessage, wait: bool) -> Result<bool> {
        self.core.ensure_writable()?;
        if !self.core.reserve(1, wait)? {
            return Ok(false);
        }
        let mut message = message;
        message.stamp();

        let guard = if self.core.spec().multiple_writers {
            Some(self.core.write_mutex().lock()?)
        } else {
            None
        };
        let ctrl = self.core.ctrl();
        let head = ctrl.head.load(Ordering::Relaxed) as usize;
        unsafe { ptr::write_unaligned(self.slot(head), message) };
        ctrl.head
            .store(((head + 1) % self.core.spec().slot_count) as u64, Ordering::Relaxed);
        drop(guard);

        self.core.sem_msgs().increment()?;
        Ok(true)
    }

    pub fn pop(&self, wait: bool) -> Result<Option<ThreadMessage>> {
        self.core.ensure_readable()?;
        if !self.core.sem_msgs().decrement(wait)? {
            return Ok(None);
        }
        let ctrl = self.core.ctrl();
        let tail = ctrl.tail.load(Ordering::Relaxed) as usize;
        let message = unsafe { ptr::read_unaligned(self.slot(tail)) };
        ctrl.tail
            .store(((tail + 1) % self.core.spec().slot_count) as u64, Ordering::Relaxed);
        self.core.release_slots(1)?;
        Ok(Some(message))
    }

    /// Copy of the oldest message, left in place.
    pub fn peek(&self, wait: bool) -> Result<Option<ThreadMessage>> {
        self.core.ensure_readable()?;
        if !self.core.sem_msgs().decrement(wait)? {
            return Ok(None);
        }
        let tail = self.core.ctrl().tail.load(Ordering::Relaxed) as usize;
        let message = unsafe { ptr::read_unaligned(self.slot(tail)) };
        self.core.sem_msgs().increment()?;
        Ok(Some(message))
    }

    pub fn queue_id(&self) -> i32 {
        self.core.spec().queue_id
    }

    pub fn mode(&self) -> QueueMode {
        self.core.mode()
    }

    pub fn slot_count(&self) -> usize {
        self.core.spec().slot_count
    }

    pub fn is_public(&self) -> bool {
        self.core.is_public()
    }

    pub fn segment_name(&self) -> Option<&str> {
        self.core.segment_name()
    }

    pub fn messages(&self) -> usize {
        self.core.messages()
    }

    pub fn free_slots(&self) -> usize {
        self.core.free_slots()
    }
}

impl std::fmt::Debug for ThreadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_queue_core("ThreadQueue", &self.core, f)
    }
}
