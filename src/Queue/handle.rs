use super::layout::{QueueCtrl, SLOTS_OFFSET};
use crate::config::PublicQueueDef;
use crate::error::{IpcError, Result};
use crate::Core::pool::SharedPool;
use crate::Core::SharedMemory::SharedSegment;
use crate::Synch::{MutexGuard, RawMutex, RawSemaphore};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which ends of a queue a handle may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueueMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl QueueMode {
    pub fn can_read(self) -> bool {
        matches!(self, QueueMode::ReadOnly | QueueMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, QueueMode::WriteOnly | QueueMode::ReadWrite)
    }
}

/// Geometry and sharing rules of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub queue_id: i32,
    pub name: String,
    pub slot_size: usize,
    pub slot_count: usize,
    pub multiple_readers: bool,
    pub multiple_writers: bool,
}

impl From<&PublicQueueDef> for QueueSpec {
    fn from(def: &PublicQueueDef) -> Self {
        Self {
            queue_id: def.queue_id,
            name: def.name.clone(),
            slot_size: def.slot_size,
            slot_count: def.slot_count,
            multiple_readers: def.multiple_readers,
            multiple_writers: def.multiple_writers,
        }
    }
}

impl QueueSpec {
    fn region_size(&self) -> usize {
        SLOTS_OFFSET + self.slot_size * self.slot_count
    }

    fn validate(&self) -> Result<()> {
        if self.slot_size == 0 || self.slot_count == 0 {
            return Err(IpcError::InvalidConfig(format!(
                "queue {}: slot size and slot count must be non-zero",
                self.queue_id
            )));
        }
        if self.slot_count > i32::MAX as usize {
            return Err(IpcError::InvalidConfig(format!(
                "queue {}: slot count {} too large",
                self.queue_id, self.slot_count
            )));
        }
        Ok(())
    }
}

/// Heap storage of a private queue, shared by every handle `reopen`ed from it.
struct PrivateStorage {
    registry: RawMutex,
    ctrl: QueueCtrl,
    data: NonNull<u8>,
    data_len: usize,
    read_mutex: RawMutex,
    write_mutex: RawMutex,
    sem_free: RawSemaphore,
    sem_msgs: RawSemaphore,
}

impl PrivateStorage {
    fn new(spec: &QueueSpec) -> Arc<Self> {
        let data_len = spec.slot_size * spec.slot_count;
        let data = Box::into_raw(vec![0u8; data_len].into_boxed_slice()) as *mut u8;
        let count = spec.slot_count as i64;
        Arc::new(Self {
            registry: RawMutex::new(false, true),
            ctrl: QueueCtrl::zeroed(),
            // Box never hands out null.
            data: unsafe { NonNull::new_unchecked(data) },
            data_len,
            read_mutex: RawMutex::new(false, true),
            write_mutex: RawMutex::new(false, true),
            sem_free: RawSemaphore::new(count, count, false),
            sem_msgs: RawSemaphore::new(0, count, false),
        })
    }
}

impl Drop for PrivateStorage {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.data.as_ptr(),
                self.data_len,
            )));
        }
    }
}

enum Backing {
    Private(Arc<PrivateStorage>),
    Public {
        segment: SharedSegment,
        pool: Arc<SharedPool>,
    },
}

/// One opened handle onto a queue: the control block, the slot storage and
/// the four synchronization objects, resolved once at open.
pub(crate) struct QueueCore {
    backing: Backing,
    ctrl: NonNull<QueueCtrl>,
    data: NonNull<u8>,
    read_mutex: NonNull<RawMutex>,
    write_mutex: NonNull<RawMutex>,
    sem_free: NonNull<RawSemaphore>,
    sem_msgs: NonNull<RawSemaphore>,
    purpose: &'static str,
    mode: QueueMode,
    spec: QueueSpec,
}

// Shared state is atomics plus slot bytes guarded by the queue semaphores.
unsafe impl Send for QueueCore {}
unsafe impl Sync for QueueCore {}

impl QueueCore {
    pub(crate) fn open_private(spec: QueueSpec, mode: QueueMode) -> Result<Self> {
        spec.validate()?;
        let storage = PrivateStorage::new(&spec);
        {
            let ctrl = &storage.ctrl;
            ctrl.queue_id.store(spec.queue_id, Ordering::Relaxed);
            ctrl.slot_size.store(spec.slot_size as u32, Ordering::Relaxed);
            ctrl.slot_count.store(spec.slot_count as u32, Ordering::Relaxed);
            ctrl.multiple_readers
                .store(spec.multiple_readers as u32, Ordering::Relaxed);
            ctrl.multiple_writers
                .store(spec.multiple_writers as u32, Ordering::Relaxed);
            ctrl.initialized.store(1, Ordering::Release);
        }
        Self::attach_private(storage, spec, mode)
    }

    fn attach_private(storage: Arc<PrivateStorage>, spec: QueueSpec, mode: QueueMode) -> Result<Self> {
        {
            let _guard = storage.registry.lock()?;
            Self::check_and_register(&storage.ctrl, &spec, mode)?;
        }
        Ok(Self {
            ctrl: NonNull::from(&storage.ctrl),
            data: storage.data,
            read_mutex: NonNull::from(&storage.read_mutex),
            write_mutex: NonNull::from(&storage.write_mutex),
            sem_free: NonNull::from(&storage.sem_free),
            sem_msgs: NonNull::from(&storage.sem_msgs),
            backing: Backing::Private(storage),
            purpose: "",
            mode,
            spec,
        })
    }

    /// Open (creating on first use) the queue segment for `spec` and register
    /// this handle under `mode`.
    pub(crate) fn open_public(
        pool: &Arc<SharedPool>,
        spec: QueueSpec,
        mode: QueueMode,
        purpose: &'static str,
    ) -> Result<Self> {
        spec.validate()?;
        let label = if spec.name.is_empty() { purpose } else { spec.name.as_str() };
        let name = pool.config().object_name(purpose, label, spec.queue_id);
        let segment = SharedSegment::open(&name, spec.region_size())?;
        let ctrl_ptr = segment.data_ptr() as *mut QueueCtrl;
        let ctrl = unsafe { &*ctrl_ptr };

        let guard = segment.lock()?;
        if ctrl.initialized.load(Ordering::Acquire) == 0 {
            Self::initialize_public(pool, ctrl, &spec)?;
            debug!(queue_id = spec.queue_id, segment = %name, "initialized public queue");
        } else if ctrl.slot_size.load(Ordering::Relaxed) as usize != spec.slot_size
            || ctrl.slot_count.load(Ordering::Relaxed) as usize != spec.slot_count
        {
            return Err(IpcError::InvalidConfig(format!(
                "queue {} already exists with slot size {} and slot count {}",
                spec.queue_id,
                ctrl.slot_size.load(Ordering::Relaxed),
                ctrl.slot_count.load(Ordering::Relaxed),
            )));
        }

        let read_mutex = NonNull::from(pool.mutex(ctrl.read_mutex.load(Ordering::Relaxed))?);
        let write_mutex = NonNull::from(pool.mutex(ctrl.write_mutex.load(Ordering::Relaxed))?);
        let sem_free = NonNull::from(pool.semaphore(ctrl.sem_free.load(Ordering::Relaxed))?);
        let sem_msgs = NonNull::from(pool.semaphore(ctrl.sem_msgs.load(Ordering::Relaxed))?);

        // The stored flags win over the caller's view of the queue.
        let spec = QueueSpec {
            multiple_readers: ctrl.multiple_readers.load(Ordering::Relaxed) != 0,
            multiple_writers: ctrl.multiple_writers.load(Ordering::Relaxed) != 0,
            ..spec
        };
        Self::check_and_register(ctrl, &spec, mode)?;
        drop(guard);

        let data = unsafe { NonNull::new_unchecked(segment.data_ptr().add(SLOTS_OFFSET)) };
        debug!(queue_id = spec.queue_id, ?mode, segment = %name, "opened public queue");
        Ok(Self {
            ctrl: NonNull::from(ctrl),
            data,
            read_mutex,
            write_mutex,
            sem_free,
            sem_msgs,
            backing: Backing::Public {
                segment,
                pool: Arc::clone(pool),
            },
            purpose,
            mode,
            spec,
        })
    }

    // Caller holds the segment mutex and has seen `initialized == 0`.
    fn initialize_public(pool: &SharedPool, ctrl: &QueueCtrl, spec: &QueueSpec) -> Result<()> {
        let count = spec.slot_count as i64;
        let read_mutex = pool.next_mutex()?;
        let write_mutex = pool.next_mutex().map_err(|e| {
            let _ = pool.free_mutex(read_mutex);
            e
        })?;
        let sem_free = pool.next_semaphore(count, count).map_err(|e| {
            let _ = pool.free_mutex(read_mutex);
            let _ = pool.free_mutex(write_mutex);
            e
        })?;
        let sem_msgs = pool.next_semaphore(0, count).map_err(|e| {
            let _ = pool.free_mutex(read_mutex);
            let _ = pool.free_mutex(write_mutex);
            let _ = pool.free_semaphore(sem_free);
            e
        })?;

        ctrl.queue_id.store(spec.queue_id, Ordering::Relaxed);
        ctrl.ref_count.store(0, Ordering::Relaxed);
        ctrl.readers.store(0, Ordering::Relaxed);
        ctrl.writers.store(0, Ordering::Relaxed);
        ctrl.multiple_readers
            .store(spec.multiple_readers as u32, Ordering::Relaxed);
        ctrl.multiple_writers
            .store(spec.multiple_writers as u32, Ordering::Relaxed);
        ctrl.slot_size.store(spec.slot_size as u32, Ordering::Relaxed);
        ctrl.slot_count.store(spec.slot_count as u32, Ordering::Relaxed);
        ctrl.read_mutex.store(read_mutex, Ordering::Relaxed);
        ctrl.write_mutex.store(write_mutex, Ordering::Relaxed);
        ctrl.sem_free.store(sem_free, Ordering::Relaxed);
        ctrl.sem_msgs.store(sem_msgs, Ordering::Relaxed);
        ctrl.head.store(0, Ordering::Relaxed);
        ctrl.tail.store(0, Ordering::Relaxed);
        ctrl.initialized.store(1, Ordering::Release);
        Ok(())
    }

    /// A second handle onto the same private storage. Public queues are
    /// shared by opening them again by id.
    pub(crate) fn reopen(&self, mode: QueueMode) -> Result<Self> {
        match &self.backing {
            Backing::Private(storage) => {
                Self::attach_private(Arc::clone(storage), self.spec.clone(), mode)
            }
            Backing::Public { pool, .. } => {
                Self::open_public(pool, self.spec.clone(), mode, self.purpose)
            }
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_>> {
        match &self.backing {
            Backing::Private(storage) => storage.registry.lock(),
            Backing::Public { segment, .. } => segment.lock(),
        }
    }

    // Check and increment happen under one registry lock so two racing
    // openers cannot both pass as the single reader or writer.
    fn check_and_register(ctrl: &QueueCtrl, spec: &QueueSpec, mode: QueueMode) -> Result<()> {
        if mode.can_read()
            && !spec.multiple_readers
            && ctrl.readers.load(Ordering::Relaxed) > 0
        {
            return Err(IpcError::MultipleReadersNotAllowed {
                queue_id: spec.queue_id,
            });
        }
        if mode.can_write()
            && !spec.multiple_writers
            && ctrl.writers.load(Ordering::Relaxed) > 0
        {
            return Err(IpcError::MultipleWritersNotAllowed {
                queue_id: spec.queue_id,
            });
        }
        if mode.can_read() {
            ctrl.readers.fetch_add(1, Ordering::Relaxed);
        }
        if mode.can_write() {
            ctrl.writers.fetch_add(1, Ordering::Relaxed);
        }
        ctrl.ref_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        let _guard = self.registry()?;
        let ctrl = self.ctrl();
        if self.mode.can_read() {
            ctrl.readers.fetch_sub(1, Ordering::Relaxed);
        }
        if self.mode.can_write() {
            ctrl.writers.fetch_sub(1, Ordering::Relaxed);
        }
        let remaining = ctrl.ref_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining > 0 {
            return Ok(());
        }
        if let Backing::Public { pool, .. } = &self.backing {
            ctrl.initialized.store(0, Ordering::Release);
            pool.free_mutex(ctrl.read_mutex.swap(0, Ordering::Relaxed))?;
            pool.free_mutex(ctrl.write_mutex.swap(0, Ordering::Relaxed))?;
            pool.free_semaphore(ctrl.sem_free.swap(0, Ordering::Relaxed))?;
            pool.free_semaphore(ctrl.sem_msgs.swap(0, Ordering::Relaxed))?;
            debug!(queue_id = self.spec.queue_id, "released public queue objects");
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn ctrl(&self) -> &QueueCtrl {
        unsafe { self.ctrl.as_ref() }
    }

    #[inline]
    pub(crate) fn read_mutex(&self) -> &RawMutex {
        unsafe { self.read_mutex.as_ref() }
    }

    #[inline]
    pub(crate) fn write_mutex(&self) -> &RawMutex {
        unsafe { self.write_mutex.as_ref() }
    }

    #[inline]
    pub(crate) fn sem_free(&self) -> &RawSemaphore {
        unsafe { self.sem_free.as_ref() }
    }

    #[inline]
    pub(crate) fn sem_msgs(&self) -> &RawSemaphore {
        unsafe { self.sem_msgs.as_ref() }
    }

    pub(crate) fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    pub(crate) fn mode(&self) -> QueueMode {
        self.mode
    }

    pub(crate) fn is_public(&self) -> bool {
        matches!(self.backing, Backing::Public { .. })
    }

    pub(crate) fn segment_name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Public { segment, .. } => Some(segment.name()),
            Backing::Private(_) => None,
        }
    }

    pub(crate) fn ring_capacity(&self) -> usize {
        self.spec.slot_size * self.spec.slot_count
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.mode.can_write() {
            Ok(())
        } else {
            Err(IpcError::NotOpenForWriting {
                queue_id: self.spec.queue_id,
            })
        }
    }

    pub(crate) fn ensure_readable(&self) -> Result<()> {
        if self.mode.can_read() {
            Ok(())
        } else {
            Err(IpcError::NotOpenForReading {
                queue_id: self.spec.queue_id,
            })
        }
    }

    /// Take `slots` free slots. On a non-blocking miss or a cancelled wait
    /// every slot already taken is handed back first.
    pub(crate) fn reserve(&self, slots: usize, wait: bool) -> Result<bool> {
        for taken in 0..slots {
            match self.sem_free().decrement(wait) {
                Ok(true) => {}
                Ok(false) => {
                    self.release_slots(taken)?;
                    return Ok(false);
                }
                Err(e) => {
                    self.release_slots(taken)?;
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    pub(crate) fn release_slots(&self, slots: usize) -> Result<()> {
        for _ in 0..slots {
            self.sem_free().increment()?;
        }
        Ok(())
    }

    /// Complete records waiting to be popped.
    pub fn messages(&self) -> usize {
        self.sem_msgs().count().max(0) as usize
    }

    pub fn free_slots(&self) -> usize {
        self.sem_free().count().max(0) as usize
    }
}

impl Drop for QueueCore {
    fn drop(&mut self) {
        if let Err(e) = self.unregister() {
            warn!(queue_id = self.spec.queue_id, error = %e, "queue close failed");
        } else {
            debug!(queue_id = self.spec.queue_id, mode = ?self.mode, "closed queue");
        }
    }
}
