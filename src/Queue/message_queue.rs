use super::handle::{QueueCore, QueueMode, QueueSpec};
use crate::config::RECORD_PREFIX;
use crate::error::{IpcError, Result};
use crate::Buffer::{copy_from_ring, copy_into_ring};
use crate::Core::pool::SharedPool;
use crate::Synch::MutexGuard;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const WRITE_LOCK_RETRIES: usize = 64;

/// A bounded queue of serialized records.
///
/// Each record is a little-endian `u32` total length (prefix included)
/// followed by the bincode payload, laid across one or more consecutive
/// slots. A record always starts on a slot boundary.
pub struct MessageQueue<M> {
    core: QueueCore,
    _marker: PhantomData<fn(M) -> M>,
}

impl<M> MessageQueue<M>
where
    M: Serialize + DeserializeOwned,
{
    pub(crate) fn from_core(core: QueueCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// A private queue living on this process's heap.
    pub fn open_private(spec: QueueSpec, mode: QueueMode) -> Result<Self> {
        QueueCore::open_private(spec, mode).map(Self::from_core)
    }

    /// Open a public queue from the definition stored in the global pool.
    pub fn open_public(queue_id: i32, mode: QueueMode) -> Result<Self> {
        Self::open_public_in(&SharedPool::global()?, queue_id, mode)
    }

    pub fn open_public_in(pool: &Arc<SharedPool>, queue_id: i32, mode: QueueMode) -> Result<Self> {
        let def = pool.public_queue(queue_id)?;
        QueueCore::open_public(pool, QueueSpec::from(&def), mode, "queue").map(Self::from_core)
    }

    /// Another handle onto the same queue, registered under `mode`.
    pub fn reopen(&self, mode: QueueMode) -> Result<Self> {
        self.core.reopen(mode).map(Self::from_core)
    }

    fn slots_for(&self, length: usize) -> Result<usize> {
        let spec = self.core.spec();
        let slots = length.div_ceil(spec.slot_size);
        if slots > spec.slot_count {
            return Err(IpcError::MessageTooLarge {
                queue_id: spec.queue_id,
                length,
                capacity: self.core.ring_capacity(),
            });
        }
        Ok(slots)
    }

    /// Append one record. `Ok(false)` means `wait` was false and there was
    /// no room.
    ///
    /// With several writers the write lock is always taken before any slot
    /// is reserved, so a writer blocked for room holds it. A non-blocking
    /// push that keeps finding the lock busy after a short retry reports
    /// `Ok(false)` as well, since the holder is either copying or waiting
    /// for the same room.
    pub fn push(&self, message: &M, wait: bool) -> Result<bool> {
        self.core.ensure_writable()?;
        let payload = bincode::serialize(message)?;
        let length = RECORD_PREFIX + payload.len();
        let slots = self.slots_for(length)?;
        let prefix = u32::try_from(length).map_err(|_| IpcError::MessageTooLarge {
            queue_id: self.core.spec().queue_id,
            length,
            capacity: self.core.ring_capacity(),
        })?;

        let guard = if self.core.spec().multiple_writers {
            match self.writer_guard(wait)? {
                Some(g) => Some(g),
                None => return Ok(false),
            }
        } else {
            None
        };
        if !self.core.reserve(slots, wait)? {
            return Ok(false);
        }

        let ctrl = self.core.ctrl();
        let spec = self.core.spec();
        let capacity = self.core.ring_capacity();
        let head = ctrl.head.load(Ordering::Relaxed) as usize;
        unsafe {
            let base = self.core.data_ptr();
            let pos = copy_into_ring(base, capacity, head * spec.slot_size, &prefix.to_le_bytes());
            copy_into_ring(base, capacity, pos, &payload);
        }
        ctrl.head
            .store(((head + slots) % spec.slot_count) as u64, Ordering::Relaxed);
        drop(guard);

        self.core.sem_msgs().increment()?;
        Ok(true)
    }

    fn writer_guard(&self, wait: bool) -> Result<Option<MutexGuard<'_>>> {
        if wait {
            return self.core.write_mutex().lock().map(Some);
        }
        for _ in 0..WRITE_LOCK_RETRIES {
            if let Some(g) = self.core.write_mutex().try_lock()? {
                return Ok(Some(g));
            }
            std::thread::yield_now();
        }
        Ok(None)
    }

    /// Remove the oldest record. `Ok(None)` means `wait` was false and the
    /// queue was empty.
    pub fn pop(&self, wait: bool) -> Result<Option<M>> {
        self.core.ensure_readable()?;
        if !self.core.sem_msgs().decrement(wait)? {
            return Ok(None);
        }
        let guard = if self.core.spec().multiple_readers {
            Some(self.core.read_mutex().lock()?)
        } else {
            None
        };

        let ctrl = self.core.ctrl();
        let spec = self.core.spec();
        let capacity = self.core.ring_capacity();
        let tail = ctrl.tail.load(Ordering::Relaxed) as usize;
        let base = self.core.data_ptr();

        let mut prefix = [0u8; RECORD_PREFIX];
        let pos = unsafe { copy_from_ring(base, capacity, tail * spec.slot_size, &mut prefix) };
        let length = u32::from_le_bytes(prefix) as usize;
        if length < RECORD_PREFIX || length > capacity {
            return Err(IpcError::CorruptRecord {
                queue_id: spec.queue_id,
                length,
                slot: tail,
            });
        }
        let mut payload = vec![0u8; length - RECORD_PREFIX];
        unsafe { copy_from_ring(base, capacity, pos, &mut payload) };

        let slots = length.div_ceil(spec.slot_size);
        ctrl.tail
            .store(((tail + slots) % spec.slot_count) as u64, Ordering::Relaxed);
        drop(guard);

        self.core.release_slots(slots)?;
        Ok(Some(bincode::deserialize(&payload)?))
    }

    pub fn queue_id(&self) -> i32 {
        self.core.spec().queue_id
    }

    pub fn mode(&self) -> QueueMode {
        self.core.mode()
    }

    pub fn spec(&self) -> &QueueSpec {
        self.core.spec()
    }

    pub fn is_public(&self) -> bool {
        self.core.is_public()
    }

    pub fn messages(&self) -> usize {
        self.core.messages()
    }

    pub fn free_slots(&self) -> usize {
        self.core.free_slots()
    }
}

impl<M> std::fmt::Debug for MessageQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_queue_core("MessageQueue", &self.core, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(slot_size: usize, slot_count: usize) -> QueueSpec {
        QueueSpec {
            queue_id: 1,
            name: String::new(),
            slot_size,
            slot_count,
            multiple_readers: false,
            multiple_writers: false,
        }
    }

    #[test]
    fn records_span_slots_and_wrap() {
        let q = MessageQueue::<String>::open_private(spec(8, 5), QueueMode::ReadWrite).unwrap();
        // 4 prefix + 8 length + 10 bytes = 22 bytes, three slots.
        let text = "0123456789".to_string();
        assert!(q.push(&text, false).unwrap());
        assert_eq!(q.free_slots(), 2);
        assert_eq!(q.pop(false).unwrap().as_deref(), Some("0123456789"));
        // Head now sits at slot 3; this record wraps to slot 0.
        assert!(q.push(&text, false).unwrap());
        assert_eq!(q.pop(false).unwrap(), Some(text));
        assert_eq!(q.free_slots(), 5);
    }

    #[test]
    fn failed_reservation_is_rolled_back() {
        let q = MessageQueue::<Vec<u8>>::open_private(spec(8, 4), QueueMode::ReadWrite).unwrap();
        assert!(q.push(&vec![1u8; 4], false).unwrap()); // 16 bytes, two slots
        assert_eq!(q.free_slots(), 2);
        // Needs three slots, two are free.
        assert!(!q.push(&vec![2u8; 10], false).unwrap());
        assert_eq!(q.free_slots(), 2);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let q = MessageQueue::<Vec<u8>>::open_private(spec(8, 2), QueueMode::ReadWrite).unwrap();
        assert!(matches!(
            q.push(&vec![0u8; 64], false),
            Err(IpcError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn mode_is_enforced() {
        let q = MessageQueue::<u32>::open_private(spec(16, 2), QueueMode::WriteOnly).unwrap();
        assert!(matches!(q.pop(false), Err(IpcError::NotOpenForReading { .. })));
        let reader = q.reopen(QueueMode::ReadOnly).unwrap();
        assert!(matches!(reader.push(&1, false), Err(IpcError::NotOpenForWriting { .. })));
        assert!(matches!(
            q.reopen(QueueMode::ReadOnly),
            Err(IpcError::MultipleReadersNotAllowed { .. })
        ));
        drop(reader);
        assert!(q.reopen(QueueMode::ReadOnly).is_ok());
    }
}
