use super::handle::{QueueCore, QueueMode, QueueSpec};
use super::message_queue::MessageQueue;
use super::thread_queue::ThreadQueue;
use crate::config::PublicQueueDef;
use crate::error::Result;
use crate::Core::pool::SharedPool;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub struct QueueBuilder {
    spec: QueueSpec,
    mode: QueueMode,
    public: bool,
    pool: Option<Arc<SharedPool>>,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            spec: QueueSpec {
                queue_id: 0,
                name: String::new(),
                slot_size: 128,
                slot_count: 1024,
                multiple_readers: false,
                multiple_writers: false,
            },
            mode: QueueMode::ReadWrite,
            public: false,
            pool: None,
        }
    }
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a configured public queue definition.
    pub fn from_definition(def: &PublicQueueDef) -> Self {
        Self {
            spec: QueueSpec::from(def),
            public: true,
            ..Self::default()
        }
    }

    pub fn with_queue_id(mut self, queue_id: i32) -> Self {
        self.spec.queue_id = queue_id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.spec.slot_size = slot_size;
        self
    }

    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.spec.slot_count = slot_count;
        self
    }

    pub fn multiple_readers(mut self, allowed: bool) -> Self {
        self.spec.multiple_readers = allowed;
        self
    }

    pub fn multiple_writers(mut self, allowed: bool) -> Self {
        self.spec.multiple_writers = allowed;
        self
    }

    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    /// Back the queue with a named shared segment instead of the heap.
    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Use `pool` for the queue's primitives instead of the global pool.
    /// Implies `public(true)`.
    pub fn with_pool(mut self, pool: Arc<SharedPool>) -> Self {
        self.pool = Some(pool);
        self.public = true;
        self
    }

    fn pool(&self) -> Result<Arc<SharedPool>> {
        match &self.pool {
            Some(pool) => Ok(Arc::clone(pool)),
            None => SharedPool::global(),
        }
    }

    pub fn build<M>(self) -> Result<MessageQueue<M>>
    where
        M: Serialize + DeserializeOwned,
    {
        let core = if self.public {
            QueueCore::open_public(&self.pool()?, self.spec, self.mode, "queue")?
        } else {
            QueueCore::open_private(self.spec, self.mode)?
        };
        Ok(MessageQueue::from_core(core))
    }

    /// A thread queue with this builder's id and slot count. Slot size and
    /// the sharing flags are fixed for thread queues.
    pub fn build_thread_queue(self) -> Result<ThreadQueue> {
        if self.public {
            ThreadQueue::open_public_in(&self.pool()?, self.spec.queue_id, self.spec.slot_count, self.mode)
        } else {
            ThreadQueue::open_private(self.spec.queue_id, self.spec.slot_count, self.mode)
        }
    }
}
