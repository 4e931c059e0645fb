pub mod SharedMemory;
pub mod futex;
pub mod pool;

pub use SharedMemory::{
    attach_shared_memory, create_shared_memory, remove_shared_memory, DestroyHook,
    SharedMemoryBackend, SharedSegment,
};
pub use pool::{PoolUsage, SharedPool};
