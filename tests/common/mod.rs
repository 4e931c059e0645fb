// Helpers shared by the integration tests.
#![allow(dead_code)]

use dmxp_ipc::config::{PublicQueueDef, RuntimeConfig};
use std::sync::Once;

/// Route library logs to the test harness. `RUST_LOG=debug` for detail.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A small pool in a namespace no other test or test run shares.
pub fn test_config(tag: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.namespace = format!("dmxp_t{}_{}_", std::process::id(), tag);
    config.pool.max_mutexes = 64;
    config.pool.max_semaphores = 64;
    config.actor.queue_size = 64;
    config
}

pub fn queue_def(
    queue_id: i32,
    slot_size: usize,
    slot_count: usize,
    multiple_readers: bool,
    multiple_writers: bool,
) -> PublicQueueDef {
    PublicQueueDef {
        queue_id,
        name: format!("q{}", queue_id),
        slot_size,
        slot_count,
        multiple_readers,
        multiple_writers,
    }
}

/// Install `config` as the process-wide configuration, once per test binary.
pub fn install_global(config: RuntimeConfig) {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        dmxp_ipc::init(config).expect("install test configuration");
    });
}

pub fn shm_exists(name: &str) -> bool {
    std::path::Path::new(&format!("/dev/shm/{}", name)).exists()
}
