// Counting semaphore with a lock-free fast path.
//
// `count` goes negative to record blocked waiters. An increment that finds
// waiters posts one grant on the `grants` futex word; a blocked decrementer
// consumes exactly one grant before returning.

use super::cancel;
use crate::error::{IpcError, Result};
use crate::Core::futex::{futex_wait, futex_wake};
use crate::Core::pool::SharedPool;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

const FLAG_PROCESS_PRIVATE: u32 = 1;

#[repr(C)]
pub struct RawSemaphore {
    count: AtomicI64,
    initial: AtomicI64,
    /// Ceiling for `count`; 0 means unbounded.
    max: AtomicI64,
    grants: AtomicU32,
    flags: AtomicU32,
    pub(crate) next_free: AtomicI32,
    _reserved: u32,
}

impl RawSemaphore {
    pub const fn new(initial: i64, max: i64, shared: bool) -> Self {
        Self {
            count: AtomicI64::new(initial),
            initial: AtomicI64::new(initial),
            max: AtomicI64::new(max),
            grants: AtomicU32::new(0),
            flags: AtomicU32::new(if shared { 0 } else { FLAG_PROCESS_PRIVATE }),
            next_free: AtomicI32::new(0),
            _reserved: 0,
        }
    }

    /// Re-arm a pooled block. Caller holds the pool lock.
    pub(crate) fn reset(&self, initial: i64, max: i64, shared: bool) {
        self.initial.store(initial, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
        self.grants.store(0, Ordering::Relaxed);
        self.flags
            .store(if shared { 0 } else { FLAG_PROCESS_PRIVATE }, Ordering::Relaxed);
        self.count.store(initial, Ordering::Release);
    }

    fn shared(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_PROCESS_PRIVATE == 0
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn initial(&self) -> i64 {
        self.initial.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> i64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Take one unit. `Ok(false)` when `wait` is false and none is available.
    pub fn decrement(&self, wait: bool) -> Result<bool> {
        if !wait {
            let mut current = self.count.load(Ordering::Acquire);
            loop {
                if current <= 0 {
                    return Ok(false);
                }
                match self.count.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(true),
                    Err(actual) => current = actual,
                }
            }
        }

        if self.count.fetch_sub(1, Ordering::AcqRel) > 0 {
            return Ok(true);
        }
        self.wait_for_grant()
    }

    pub fn increment(&self) -> Result<()> {
        let max = self.max.load(Ordering::Relaxed);
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if max > 0 && prev >= max {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(IpcError::SemaphoreOverflow { max });
        }
        if prev < 0 {
            self.grants.fetch_add(1, Ordering::Release);
            futex_wake(&self.grants, 1, self.shared());
        }
        Ok(())
    }

    fn take_grant(&self) -> bool {
        let mut grants = self.grants.load(Ordering::Acquire);
        while grants > 0 {
            match self.grants.compare_exchange_weak(
                grants,
                grants - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => grants = actual,
            }
        }
        false
    }

    fn wait_for_grant(&self) -> Result<bool> {
        let shared = self.shared();
        loop {
            if self.take_grant() {
                return Ok(true);
            }
            if cancel::cancel_requested() {
                return self.abandon_wait();
            }
            futex_wait(&self.grants, 0, shared);
        }
    }

    // Back this waiter out of `count`. If every waiter has already been
    // granted, one grant is ours: take it and hand the unit back.
    fn abandon_wait(&self) -> Result<bool> {
        cancel::mark_observed();
        trace!("semaphore wait cancelled");
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current < 0 {
                match self.count.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Err(IpcError::WaitCancelled),
                    Err(actual) => current = actual,
                }
                continue;
            }
            if self.take_grant() {
                self.increment()?;
                return Err(IpcError::WaitCancelled);
            }
            std::thread::yield_now();
            current = self.count.load(Ordering::Acquire);
        }
    }
}

/// Common surface of every semaphore flavour.
pub trait SemaphoreOps {
    fn raw(&self) -> &RawSemaphore;

    fn decrement(&self, wait: bool) -> Result<bool> {
        self.raw().decrement(wait)
    }

    fn increment(&self) -> Result<()> {
        self.raw().increment()
    }

    fn count(&self) -> i64 {
        self.raw().count()
    }

    fn initial(&self) -> i64 {
        self.raw().initial()
    }
}

pub struct SemaphorePrivate {
    raw: Box<RawSemaphore>,
}

impl SemaphorePrivate {
    pub fn new(initial: i64, max: i64) -> Self {
        Self {
            raw: Box::new(RawSemaphore::new(initial, max, false)),
        }
    }
}

impl SemaphoreOps for SemaphorePrivate {
    fn raw(&self) -> &RawSemaphore {
        &self.raw
    }
}

/// Semaphore living in the shared primitive pool, addressed by its handle.
pub struct SemaphorePublic {
    pool: Arc<SharedPool>,
    handle: i32,
    raw: NonNull<RawSemaphore>,
    owned: bool,
}

unsafe impl Send for SemaphorePublic {}
unsafe impl Sync for SemaphorePublic {}

impl SemaphorePublic {
    pub fn new(initial: i64, max: i64) -> Result<Self> {
        Self::new_in(&SharedPool::global()?, initial, max)
    }

    pub fn new_in(pool: &Arc<SharedPool>, initial: i64, max: i64) -> Result<Self> {
        let handle = pool.next_semaphore(initial, max)?;
        let raw = NonNull::from(pool.semaphore(handle)?);
        Ok(Self {
            pool: Arc::clone(pool),
            handle,
            raw,
            owned: true,
        })
    }

    pub fn attach(handle: i32) -> Result<Self> {
        Self::attach_in(&SharedPool::global()?, handle)
    }

    pub fn attach_in(pool: &Arc<SharedPool>, handle: i32) -> Result<Self> {
        let raw = NonNull::from(pool.semaphore(handle)?);
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

    pub fn into_handle(mut self) -> i32 {
        self.owned = false;
        self.handle
    }
}

impl SemaphoreOps for SemaphorePublic {
    fn raw(&self) -> &RawSemaphore {
        unsafe { self.raw.as_ref() }
    }
}

impl Drop for SemaphorePublic {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = self.pool.free_semaphore(self.handle) {
                warn!(handle = self.handle, error = %e, "failed to return semaphore to pool");
            }
        }
    }
}

pub enum Semaphore {
    Private(SemaphorePrivate),
    Public(SemaphorePublic),
}

impl SemaphoreOps for Semaphore {
    fn raw(&self) -> &RawSemaphore {
        match self {
            Semaphore::Private(s) => s.raw(),
            Semaphore::Public(s) => s.raw(),
        }
    }
}
