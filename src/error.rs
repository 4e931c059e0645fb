use std::fmt;
use std::io;
use thiserror::Error;

/// Which kind of pooled primitive an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Mutex,
    Semaphore,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveKind::Mutex => f.write_str("mutex"),
            PrimitiveKind::Semaphore => f.write_str("semaphore"),
        }
    }
}

/// Coarse classification used by callers to decide between retry, abort and escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// A pool, segment or OS wait object could not be obtained.
    Exhaustion,
    /// The caller broke the usage contract (wrong mode, second reader, double init).
    ContractViolation,
    /// A system call failed; the OS error is carried as the source.
    Os,
    /// A blocking wait was interrupted by `cancel_wait`.
    Cancelled,
    /// Raised by application code (message handlers) or its payloads.
    Application,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IpcError {
    // --- Resource exhaustion ---
    #[error("{kind} pool [{pool}] exhausted ({capacity} in use)")]
    PoolExhausted {
        kind: PrimitiveKind,
        pool: String,
        capacity: usize,
    },
    #[error("unable to create shared memory segment [{name}]: {source}")]
    SegmentCreate {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to map shared memory segment [{name}]: {source}")]
    SegmentMap {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("shared memory segment [{name}] holds {actual} bytes, {expected} required")]
    SegmentTooSmall {
        name: String,
        expected: usize,
        actual: usize,
    },

    // --- Contract violations ---
    #[error("queue {queue_id} is not open for writing")]
    NotOpenForWriting { queue_id: i32 },
    #[error("queue {queue_id} is not open for reading")]
    NotOpenForReading { queue_id: i32 },
    #[error("queue {queue_id} does not allow multiple readers")]
    MultipleReadersNotAllowed { queue_id: i32 },
    #[error("queue {queue_id} does not allow multiple writers")]
    MultipleWritersNotAllowed { queue_id: i32 },
    #[error("public queue {queue_id} is not defined")]
    QueueNotFound { queue_id: i32 },
    #[error("queue {queue_id}: record of {length} bytes can never fit in {capacity} bytes of slots")]
    MessageTooLarge {
        queue_id: i32,
        length: usize,
        capacity: usize,
    },
    #[error("queue {queue_id}: corrupt record length {length} at slot {slot}")]
    CorruptRecord {
        queue_id: i32,
        length: usize,
        slot: usize,
    },
    #[error("{what} is already initialized")]
    AlreadyInitialized { what: &'static str },
    #[error("{what} is not initialized")]
    NotInitialized { what: &'static str },
    #[error("{kind} handle {handle} is not valid in pool [{pool}]")]
    InvalidHandle {
        kind: PrimitiveKind,
        handle: i32,
        pool: String,
    },
    #[error("mutex released by a thread that does not hold it")]
    NotOwner,
    #[error("non-recursive mutex is already held by the calling thread")]
    RecursiveLock,
    #[error("semaphore increment would exceed its maximum count of {max}")]
    SemaphoreOverflow { max: i64 },
    #[error("ring buffer capacity exceeded: {requested} bytes requested, {free} free")]
    CapacityExceeded { requested: usize, free: usize },
    #[error("ring buffer range {offset}..{end} lies outside the {used} unconsumed bytes")]
    OutOfRange { offset: usize, end: usize, used: usize },
    #[error("message id {0} lies in the reserved lifecycle range")]
    ReservedMessageId(u32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- OS level ---
    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },

    // --- Cancellation ---
    #[error("blocking wait cancelled")]
    WaitCancelled,

    // --- Application / payload ---
    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("message handler failed: {0}")]
    Handler(String),
    #[error("thread [{0}] panicked")]
    ThreadPanicked(String),
}

impl IpcError {
    /// Wrap the last OS error with the operation that produced it.
    pub fn last_os(context: impl Into<String>) -> Self {
        IpcError::Os {
            context: context.into(),
            source: io::Error::last_os_error(),
        }
    }

    pub fn os(context: impl Into<String>, source: io::Error) -> Self {
        IpcError::Os {
            context: context.into(),
            source,
        }
    }

    pub fn severity(&self) -> Severity {
        use IpcError::*;
        match self {
            PoolExhausted { .. } | SegmentCreate { .. } | SegmentMap { .. } | SegmentTooSmall { .. } => {
                Severity::Exhaustion
            }
            NotOpenForWriting { .. }
            | NotOpenForReading { .. }
            | MultipleReadersNotAllowed { .. }
            | MultipleWritersNotAllowed { .. }
            | QueueNotFound { .. }
            | MessageTooLarge { .. }
            | CorruptRecord { .. }
            | AlreadyInitialized { .. }
            | NotInitialized { .. }
            | InvalidHandle { .. }
            | NotOwner
            | RecursiveLock
            | SemaphoreOverflow { .. }
            | CapacityExceeded { .. }
            | OutOfRange { .. }
            | ReservedMessageId(_)
            | InvalidConfig(_) => Severity::ContractViolation,
            Os { .. } | Io(_) => Severity::Os,
            WaitCancelled => Severity::Cancelled,
            Codec(_) | ConfigParse(_) | Handler(_) | ThreadPanicked(_) => Severity::Application,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IpcError::WaitCancelled)
    }
}

pub type Result<T, E = IpcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_text_is_appended_to_context() {
        let err = IpcError::os(
            "ftruncate(/dev/shm/dmxp_queue_x_1)",
            io::Error::from_raw_os_error(libc::ENOSPC),
        );
        let text = err.to_string();
        assert!(text.starts_with("ftruncate(/dev/shm/dmxp_queue_x_1): "));
        assert!(text.len() > "ftruncate(/dev/shm/dmxp_queue_x_1): ".len());
        assert_eq!(err.severity(), Severity::Os);
    }

    #[test]
    fn exhaustion_names_the_pool() {
        let err = IpcError::PoolExhausted {
            kind: PrimitiveKind::Semaphore,
            pool: "SynchObjects_1".into(),
            capacity: 8,
        };
        assert_eq!(err.to_string(), "semaphore pool [SynchObjects_1] exhausted (8 in use)");
        assert_eq!(err.severity(), Severity::Exhaustion);
    }

    #[test]
    fn mode_violation_is_contract() {
        let err = IpcError::NotOpenForReading { queue_id: 42 };
        assert_eq!(err.severity(), Severity::ContractViolation);
        assert!(err.to_string().contains("42"));
    }
}
