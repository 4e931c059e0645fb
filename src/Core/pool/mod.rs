use crate::config::{self, PublicQueueDef, RuntimeConfig};
use crate::error::{IpcError, PrimitiveKind, Result};
use crate::Core::SharedMemory::{DestroyHook, SharedSegment};
use crate::Synch::{RawMutex, RawSemaphore};
use lazy_static::lazy_static;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

mod debug;
mod getters;
pub mod layout;

pub use layout::{
    FreeListCtrl, PoolHeader, PoolLayout, QueueDefEntry, ALLOCATED, FREE_LIST_END, QUEUE_NAME_LEN,
};

/// Snapshot of one primitive array's usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub capacity: usize,
    pub curr_used: i64,
    pub max_used: i64,
}

/// Fixed arrays of mutex and semaphore control blocks in one shared segment,
/// handed out by 1-based handle. Every attached process sees the same arrays.
pub struct SharedPool {
    segment: SharedSegment,
    name: String,
    header: NonNull<PoolHeader>,
    semaphores: NonNull<RawSemaphore>,
    mutexes: NonNull<RawMutex>,
    queue_defs: NonNull<QueueDefEntry>,
    layout: PoolLayout,
    config: Arc<RuntimeConfig>,
}

// All shared state is either atomic or mutated under the segment mutex.
unsafe impl Send for SharedPool {}
unsafe impl Sync for SharedPool {}

lazy_static! {
    static ref GLOBAL_POOL: parking_lot::Mutex<Weak<SharedPool>> =
        parking_lot::Mutex::new(Weak::new());
}

struct UsageReport {
    pool: String,
}

impl DestroyHook for UsageReport {
    fn on_destroy(&self, segment: &SharedSegment) {
        let header = unsafe { &*(segment.data_ptr() as *const PoolHeader) };
        if header.initialized.load(Ordering::Acquire) == 0 {
            return;
        }
        for (kind, ctrl) in [
            (PrimitiveKind::Semaphore, &header.semaphores),
            (PrimitiveKind::Mutex, &header.mutexes),
        ] {
            info!(
                pool = %self.pool,
                %kind,
                capacity = ctrl.capacity.load(Ordering::Relaxed),
                curr_used = ctrl.curr_used.load(Ordering::Relaxed),
                max_used = ctrl.max_used.load(Ordering::Relaxed),
                "final pool usage"
            );
        }
    }
}

impl SharedPool {
    /// Attach to (creating if needed) the pool described by `config`.
    pub fn open(config: &RuntimeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let name = format!("{}_{}", config.pool.name, config.pool.id);
        let segment_name = config.object_name("shmem", &config.pool.name, config.pool.id);
        let wanted = PoolLayout::new(
            config.pool.max_semaphores,
            config.pool.max_mutexes,
            config.public_queues.len(),
        );

        let mut segment = SharedSegment::open(&segment_name, wanted.total)?;
        let header_ptr = segment.data_ptr() as *mut PoolHeader;
        let header = unsafe { &*header_ptr };

        // Double-checked: cheap flag test first, then again under the lock.
        if header.initialized.load(Ordering::Acquire) == 0 {
            let _guard = segment.lock()?;
            if header.initialized.load(Ordering::Acquire) == 0 {
                if wanted.total > segment.data_size() {
                    return Err(IpcError::SegmentTooSmall {
                        name: segment_name,
                        expected: wanted.total,
                        actual: segment.data_size(),
                    });
                }
                unsafe { initialize(segment.data_ptr(), &wanted, &config.public_queues) };
                header.initialized.store(1, Ordering::Release);
                info!(
                    pool = %name,
                    semaphores = wanted.max_semaphores,
                    mutexes = wanted.max_mutexes,
                    queues = wanted.queue_defs,
                    "initialized shared primitive pool"
                );
            }
        }

        // Whoever initialized decides the shape; attachers follow it.
        let layout = PoolLayout::new(
            header.semaphores.capacity.load(Ordering::Relaxed) as usize,
            header.mutexes.capacity.load(Ordering::Relaxed) as usize,
            header.queue_defs.load(Ordering::Relaxed) as usize,
        );
        if layout.total > segment.data_size() {
            return Err(IpcError::SegmentTooSmall {
                name: segment_name,
                expected: layout.total,
                actual: segment.data_size(),
            });
        }

        segment.set_destroy_hook(Box::new(UsageReport { pool: name.clone() }));
        debug!(pool = %name, usage = segment.usage_count(), "attached shared primitive pool");

        let base = segment.data_ptr();
        let region = |offset: usize| unsafe { base.add(offset) };
        Ok(Arc::new(Self {
            name,
            header: NonNull::new(header_ptr).ok_or(IpcError::NotInitialized { what: "pool header" })?,
            semaphores: NonNull::new(region(layout.semaphore_offset) as *mut RawSemaphore)
                .ok_or(IpcError::NotInitialized { what: "semaphore array" })?,
            mutexes: NonNull::new(region(layout.mutex_offset) as *mut RawMutex)
                .ok_or(IpcError::NotInitialized { what: "mutex array" })?,
            queue_defs: NonNull::new(region(layout.queue_offset) as *mut QueueDefEntry)
                .ok_or(IpcError::NotInitialized { what: "queue table" })?,
            layout,
            config: Arc::new(config.clone()),
            segment,
        }))
    }

    /// The process-wide pool built from `config::current()`. Held weakly:
    /// once every public object is gone the segment is detached.
    pub fn global() -> Result<Arc<Self>> {
        let mut slot = GLOBAL_POOL.lock();
        if let Some(pool) = slot.upgrade() {
            return Ok(pool);
        }
        let pool = Self::open(&config::current())?;
        *slot = Arc::downgrade(&pool);
        Ok(pool)
    }

    /// Install the process-wide configuration unless the global pool is
    /// already live. Checked and installed under the same lock `global`
    /// creates the pool under.
    pub(crate) fn install_global_config(config: RuntimeConfig) -> Result<()> {
        let slot = GLOBAL_POOL.lock();
        if slot.strong_count() > 0 {
            return Err(IpcError::AlreadyInitialized {
                what: "global primitive pool",
            });
        }
        config::install(config)?;
        drop(slot);
        Ok(())
    }

    pub fn global_is_live() -> bool {
        GLOBAL_POOL.lock().strong_count() > 0
    }

    fn header(&self) -> &PoolHeader {
        unsafe { self.header.as_ref() }
    }

    fn mutex_slot(&self, index: usize) -> &RawMutex {
        unsafe { &*self.mutexes.as_ptr().add(index) }
    }

    fn semaphore_slot(&self, index: usize) -> &RawSemaphore {
        unsafe { &*self.semaphores.as_ptr().add(index) }
    }

    fn ctrl(&self, kind: PrimitiveKind) -> &FreeListCtrl {
        match kind {
            PrimitiveKind::Mutex => &self.header().mutexes,
            PrimitiveKind::Semaphore => &self.header().semaphores,
        }
    }

    fn link(&self, kind: PrimitiveKind, index: usize) -> &AtomicI32 {
        match kind {
            PrimitiveKind::Mutex => &self.mutex_slot(index).next_free,
            PrimitiveKind::Semaphore => &self.semaphore_slot(index).next_free,
        }
    }

    fn capacity(&self, kind: PrimitiveKind) -> usize {
        match kind {
            PrimitiveKind::Mutex => self.layout.max_mutexes,
            PrimitiveKind::Semaphore => self.layout.max_semaphores,
        }
    }

    pub fn next_mutex(&self) -> Result<i32> {
        let _guard = self.segment.lock()?;
        let index = self.pop_free(PrimitiveKind::Mutex)?;
        self.mutex_slot(index).reset(true, true);
        Ok(index as i32 + 1)
    }

    pub fn next_semaphore(&self, initial: i64, max: i64) -> Result<i32> {
        let _guard = self.segment.lock()?;
        let index = self.pop_free(PrimitiveKind::Semaphore)?;
        self.semaphore_slot(index).reset(initial, max, true);
        Ok(index as i32 + 1)
    }

    pub fn free_mutex(&self, handle: i32) -> Result<()> {
        self.push_free(PrimitiveKind::Mutex, handle)
    }

    pub fn free_semaphore(&self, handle: i32) -> Result<()> {
        self.push_free(PrimitiveKind::Semaphore, handle)
    }

    /// Resolve a live handle. Handles that are out of range or currently on
    /// the free list are rejected.
    pub fn mutex(&self, handle: i32) -> Result<&RawMutex> {
        let index = self.check_handle(PrimitiveKind::Mutex, handle)?;
        Ok(self.mutex_slot(index))
    }

    pub fn semaphore(&self, handle: i32) -> Result<&RawSemaphore> {
        let index = self.check_handle(PrimitiveKind::Semaphore, handle)?;
        Ok(self.semaphore_slot(index))
    }

    fn check_handle(&self, kind: PrimitiveKind, handle: i32) -> Result<usize> {
        if handle < 1 || handle as usize > self.capacity(kind) {
            return Err(self.invalid(kind, handle));
        }
        let index = handle as usize - 1;
        if self.link(kind, index).load(Ordering::Acquire) != ALLOCATED {
            return Err(self.invalid(kind, handle));
        }
        Ok(index)
    }

    fn invalid(&self, kind: PrimitiveKind, handle: i32) -> IpcError {
        IpcError::InvalidHandle {
            kind,
            handle,
            pool: self.name.clone(),
        }
    }

    // Caller holds the segment mutex.
    fn pop_free(&self, kind: PrimitiveKind) -> Result<usize> {
        let ctrl = self.ctrl(kind);
        let head = ctrl.head.load(Ordering::Relaxed);
        if head == FREE_LIST_END {
            return Err(IpcError::PoolExhausted {
                kind,
                pool: self.name.clone(),
                capacity: ctrl.capacity.load(Ordering::Relaxed) as usize,
            });
        }
        let index = head as usize;
        let link = self.link(kind, index);
        ctrl.head.store(link.load(Ordering::Relaxed), Ordering::Relaxed);
        link.store(ALLOCATED, Ordering::Release);

        let used = ctrl.curr_used.fetch_add(1, Ordering::Relaxed) + 1;
        ctrl.max_used.fetch_max(used, Ordering::Relaxed);
        Ok(index)
    }

    fn push_free(&self, kind: PrimitiveKind, handle: i32) -> Result<()> {
        self.check_handle(kind, handle)?;
        let _guard = self.segment.lock()?;
        // Re-check: another holder may have freed it before we got the lock.
        let index = self.check_handle(kind, handle)?;
        let ctrl = self.ctrl(kind);
        self.link(kind, index)
            .store(ctrl.head.load(Ordering::Relaxed), Ordering::Release);
        ctrl.head.store(index as i32, Ordering::Relaxed);
        ctrl.curr_used.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// A public queue definition copied in by the initializing process.
    pub fn public_queue(&self, queue_id: i32) -> Result<PublicQueueDef> {
        (0..self.layout.queue_defs)
            .map(|i| unsafe { &*self.queue_defs.as_ptr().add(i) })
            .find(|entry| entry.queue_id == queue_id)
            .map(QueueDefEntry::to_def)
            .ok_or(IpcError::QueueNotFound { queue_id })
    }

    pub fn usage(&self, kind: PrimitiveKind) -> PoolUsage {
        let ctrl = self.ctrl(kind);
        PoolUsage {
            capacity: ctrl.capacity.load(Ordering::Relaxed) as usize,
            curr_used: ctrl.curr_used.load(Ordering::Relaxed),
            max_used: ctrl.max_used.load(Ordering::Relaxed),
        }
    }

    pub fn log_object_usage(&self) {
        for kind in [PrimitiveKind::Semaphore, PrimitiveKind::Mutex] {
            let usage = self.usage(kind);
            info!(
                pool = %self.name,
                %kind,
                capacity = usage.capacity,
                curr_used = usage.curr_used,
                max_used = usage.max_used,
                "pool usage"
            );
        }
    }
}

/// Build both free lists and copy the queue table.
///
/// # Safety
/// `base` points at a zero-filled data area of at least `layout.total`
/// bytes and the caller holds the segment mutex.
unsafe fn initialize(base: *mut u8, layout: &PoolLayout, queues: &[PublicQueueDef]) {
    let header = &*(base as *const PoolHeader);

    let semaphores = base.add(layout.semaphore_offset) as *mut RawSemaphore;
    for i in 0..layout.max_semaphores {
        std::ptr::write(semaphores.add(i), RawSemaphore::new(0, 0, true));
        let next = if i + 1 < layout.max_semaphores { i as i32 + 1 } else { FREE_LIST_END };
        (*semaphores.add(i)).next_free.store(next, Ordering::Relaxed);
    }
    init_ctrl(&header.semaphores, layout.max_semaphores);

    let mutexes = base.add(layout.mutex_offset) as *mut RawMutex;
    for i in 0..layout.max_mutexes {
        RawMutex::init_in_place(mutexes.add(i), true, true);
        let next = if i + 1 < layout.max_mutexes { i as i32 + 1 } else { FREE_LIST_END };
        (*mutexes.add(i)).next_free.store(next, Ordering::Relaxed);
    }
    init_ctrl(&header.mutexes, layout.max_mutexes);

    let table = base.add(layout.queue_offset) as *mut QueueDefEntry;
    for (i, def) in queues.iter().enumerate() {
        std::ptr::write(table.add(i), QueueDefEntry::from_def(def));
    }
    header.queue_defs.store(queues.len() as u32, Ordering::Relaxed);
    header.version.store(layout::POOL_VERSION, Ordering::Relaxed);
}

fn init_ctrl(ctrl: &FreeListCtrl, capacity: usize) {
    ctrl.capacity.store(capacity as i32, Ordering::Relaxed);
    ctrl.head
        .store(if capacity > 0 { 0 } else { FREE_LIST_END }, Ordering::Relaxed);
    ctrl.curr_used.store(0, Ordering::Relaxed);
    ctrl.max_used.store(0, Ordering::Relaxed);
}
