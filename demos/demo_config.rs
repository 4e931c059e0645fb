// Shared between the demo binaries with `#[path]`.

use dmxp_ipc::config::{PublicQueueDef, RuntimeConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEMO_QUEUE_ID: i32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct DemoRecord {
    pub seq: u64,
    pub hash: String,
}

pub fn demo_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.namespace = "dmxp_demo_".into();
    config.public_queues.push(PublicQueueDef {
        queue_id: DEMO_QUEUE_ID,
        name: "hashes".into(),
        slot_size: 128,
        slot_count: 1024,
        multiple_readers: false,
        multiple_writers: true,
    });
    config
}

pub fn hash_of(seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("message_{}", seq).as_bytes());
    format!("{:x}", hasher.finalize())
}
