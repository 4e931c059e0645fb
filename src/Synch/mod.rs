pub mod cancel;
pub mod mutex;
pub mod semaphore;

pub use cancel::CancelToken;
pub use mutex::{Lockable, Mutex, MutexGuard, MutexPrivate, MutexPublic, RawMutex};
pub use semaphore::{
    RawSemaphore, Semaphore, SemaphoreOps, SemaphorePrivate, SemaphorePublic,
};
