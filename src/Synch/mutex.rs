// Futex-backed mutex with explicit owner + depth tracking.
//
// The control block is plain #[repr(C)] data so the same type lives on the
// heap (private flavour) or inside a pool mapping (public flavour). An
// all-zero block is a valid, unlocked, shared, recursive mutex.

use crate::error::{IpcError, Result};
use crate::Core::futex::{futex_wait, futex_wake, thread_token};
use crate::Core::pool::SharedPool;
use crossbeam_utils::Backoff;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const FLAG_PROCESS_PRIVATE: u32 = 1;
const FLAG_NON_RECURSIVE: u32 = 2;

#[repr(C)]
pub struct RawMutex {
    state: AtomicU32,
    flags: AtomicU32,
    owner: AtomicU64,
    depth: AtomicU32,
    /// Pool free-list link; meaningless for heap mutexes.
    pub(crate) next_free: AtomicI32,
}

impl RawMutex {
    pub const fn new(shared: bool, recursive: bool) -> Self {
        let mut flags = 0;
        if !shared {
            flags |= FLAG_PROCESS_PRIVATE;
        }
        if !recursive {
            flags |= FLAG_NON_RECURSIVE;
        }
        Self {
            state: AtomicU32::new(UNLOCKED),
            flags: AtomicU32::new(flags),
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            next_free: AtomicI32::new(0),
        }
    }

    /// Construct a mutex in place in raw (possibly shared) memory.
    ///
    /// # Safety
    /// `ptr` must be valid for writes and suitably aligned, and no other
    /// thread may be using the memory yet.
    pub unsafe fn init_in_place(ptr: *mut RawMutex, shared: bool, recursive: bool) {
        std::ptr::write(ptr, RawMutex::new(shared, recursive));
    }

    /// Re-arm a pooled block for a new owner. Caller holds the pool lock.
    pub(crate) fn reset(&self, shared: bool, recursive: bool) {
        let fresh = RawMutex::new(shared, recursive);
        self.flags.store(fresh.flags.load(Ordering::Relaxed), Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.depth.store(0, Ordering::Relaxed);
        self.state.store(UNLOCKED, Ordering::Release);
    }

    fn shared(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_PROCESS_PRIVATE == 0
    }

    pub fn is_recursive(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_NON_RECURSIVE == 0
    }

    /// Take the mutex. Returns `Ok(false)` only when `wait` is false and the
    /// mutex is held elsewhere.
    pub fn acquire(&self, wait: bool) -> Result<bool> {
        let me = thread_token();
        if self.owner.load(Ordering::Relaxed) == me {
            if !self.is_recursive() {
                return Err(IpcError::RecursiveLock);
            }
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        let backoff = Backoff::new();
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            if !wait {
                if self.state.load(Ordering::Relaxed) != UNLOCKED {
                    return Ok(false);
                }
                continue;
            }
            if backoff.is_completed() {
                let shared = self.shared();
                let mut seen = self.state.swap(CONTENDED, Ordering::Acquire);
                while seen != UNLOCKED {
                    futex_wait(&self.state, CONTENDED, shared);
                    seen = self.state.swap(CONTENDED, Ordering::Acquire);
                }
                break;
            }
            backoff.snooze();
        }

        self.owner.store(me, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
        Ok(true)
    }

    pub fn release(&self) -> Result<()> {
        if self.owner.load(Ordering::Relaxed) != thread_token() {
            return Err(IpcError::NotOwner);
        }
        let depth = self.depth.load(Ordering::Relaxed);
        if depth > 1 {
            self.depth.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.depth.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.state, 1, self.shared());
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_token()
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.acquire(true)?;
        Ok(MutexGuard::new(self))
    }

    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_>>> {
        Ok(self.acquire(false)?.then(|| MutexGuard::new(self)))
    }
}

/// Releases the mutex when dropped. Bound to the acquiring thread.
pub struct MutexGuard<'a> {
    raw: &'a RawMutex,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MutexGuard<'a> {
    fn new(raw: &'a RawMutex) -> Self {
        Self {
            raw,
            _not_send: PhantomData,
        }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.raw.release() {
            warn!(error = %e, "mutex guard release failed");
        }
    }
}

/// Common surface of every mutex flavour.
pub trait Lockable {
    fn raw(&self) -> &RawMutex;

    fn acquire(&self, wait: bool) -> Result<bool> {
        self.raw().acquire(wait)
    }

    fn release(&self) -> Result<()> {
        self.raw().release()
    }

    fn lock(&self) -> Result<MutexGuard<'_>> {
        self.raw().lock()
    }

    fn try_lock(&self) -> Result<Option<MutexGuard<'_>>> {
        self.raw().try_lock()
    }
}

/// Process-local mutex, recursive unless built with `non_recursive`.
pub struct MutexPrivate {
    raw: Box<RawMutex>,
}

impl MutexPrivate {
    pub fn new() -> Self {
        Self {
            raw: Box::new(RawMutex::new(false, true)),
        }
    }

    pub fn non_recursive() -> Self {
        Self {
            raw: Box::new(RawMutex::new(false, false)),
        }
    }
}

impl Default for MutexPrivate {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockable for MutexPrivate {
    fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

/// Mutex living in the shared primitive pool, addressed by its handle.
pub struct MutexPublic {
    pool: Arc<SharedPool>,
    handle: i32,
    raw: NonNull<RawMutex>,
    owned: bool,
}

// The pointer targets the pool mapping, which `pool` keeps alive.
unsafe impl Send for MutexPublic {}
unsafe impl Sync for MutexPublic {}

impl MutexPublic {
    /// Allocate a mutex from the process-wide pool.
    pub fn new() -> Result<Self> {
        Self::new_in(&SharedPool::global()?)
    }

    pub fn new_in(pool: &Arc<SharedPool>) -> Result<Self> {
        let handle = pool.next_mutex()?;
        let raw = NonNull::from(pool.mutex(handle)?);
        Ok(Self {
            pool: Arc::clone(pool),
            handle,
            raw,
            owned: true,
        })
    }

    /// Resolve a handle allocated by another holder, possibly in another process.
    pub fn attach(handle: i32) -> Result<Self> {
        Self::attach_in(&SharedPool::global()?, handle)
    }

    pub fn attach_in(pool: &Arc<SharedPool>, handle: i32) -> Result<Self> {
        let raw = NonNull::from(pool.mutex(handle)?);
        Ok(Self {
            pool: Arc::clone(pool),
            handle,
            raw,
            owned: false,
        })
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    /// Give up ownership; the handle stays allocated until someone frees it.
    pub fn into_handle(mut self) -> i32 {
        self.owned = false;
        self.handle
    }
}

impl Lockable for MutexPublic {
    fn raw(&self) -> &RawMutex {
        unsafe { self.raw.as_ref() }
    }
}

impl Drop for MutexPublic {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = self.pool.free_mutex(self.handle) {
                warn!(handle = self.handle, error = %e, "failed to return mutex to pool");
            }
        }
    }
}

/// Either flavour, chosen at configuration time.
pub enum Mutex {
    Private(MutexPrivate),
    Public(MutexPublic),
}

impl Mutex {
    pub fn is_public(&self) -> bool {
        matches!(self, Mutex::Public(_))
    }
}

impl Lockable for Mutex {
    fn raw(&self) -> &RawMutex {
        match self {
            Mutex::Private(m) => m.raw(),
            Mutex::Public(m) => m.raw(),
        }
    }
}
