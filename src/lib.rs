// Module naming follows project convention (PascalCase subsystems)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Synch;
#[allow(non_snake_case)]
pub mod Buffer;
#[allow(non_snake_case)]
pub mod Queue;
#[allow(non_snake_case)]
pub mod Thread;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod config;
pub mod error;
pub mod ffi;

pub use config::RuntimeConfig;
pub use error::{IpcError, Result, Severity};

/// Install the process-wide configuration used by the global pool and by
/// public objects opened without an explicit pool. Must run before the
/// global pool is first used.
pub fn init(config: RuntimeConfig) -> Result<()> {
    Core::SharedPool::install_global_config(config)
}
