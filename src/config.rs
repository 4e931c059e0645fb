//! Runtime configuration: pool sizing, actor queue sizing and the table of
//! public queue definitions shared by every process of a deployment.
//!
//! Processes that should see the same public objects must load the same
//! configuration (same namespace, pool name/id and queue table).

use crate::error::{IpcError, Result};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Bytes taken by the length prefix of a general queue record.
pub const RECORD_PREFIX: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix of every OS-level object name created under `/dev/shm`.
    pub namespace: String,
    pub pool: PoolConfig,
    pub actor: ActorConfig,
    pub public_queues: Vec<PublicQueueDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub id: i32,
    pub max_semaphores: usize,
    pub max_mutexes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActorConfig {
    /// Slot count of each actor thread queue.
    pub queue_size: usize,
    /// Application id used to derive public thread queue ids.
    pub app_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicQueueDef {
    pub queue_id: i32,
    #[serde(default)]
    pub name: String,
    pub slot_size: usize,
    pub slot_count: usize,
    #[serde(default)]
    pub multiple_readers: bool,
    #[serde(default)]
    pub multiple_writers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "dmxp_".to_string(),
            pool: PoolConfig::default(),
            actor: ActorConfig::default(),
            public_queues: Vec::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "SynchObjects".to_string(),
            id: 1,
            max_semaphores: 1000,
            max_mutexes: 1000,
        }
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            queue_size: 16384,
            app_id: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading runtime configuration");
        let text = std::fs::read_to_string(path)
            .map_err(|e| IpcError::os(format!("read {}", path.display()), e))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_mutexes == 0 || self.pool.max_semaphores == 0 {
            return Err(IpcError::InvalidConfig(
                "pool must hold at least one mutex and one semaphore".into(),
            ));
        }
        if self.pool.max_mutexes > i32::MAX as usize || self.pool.max_semaphores > i32::MAX as usize {
            return Err(IpcError::InvalidConfig("pool sizes must fit a 32-bit handle".into()));
        }
        if self.actor.queue_size == 0 {
            return Err(IpcError::InvalidConfig("actor queue_size must be non-zero".into()));
        }
        let mut seen = HashSet::new();
        for def in &self.public_queues {
            if !seen.insert(def.queue_id) {
                return Err(IpcError::InvalidConfig(format!(
                    "public queue {} defined twice",
                    def.queue_id
                )));
            }
            if def.slot_count == 0 || def.slot_size <= RECORD_PREFIX {
                return Err(IpcError::InvalidConfig(format!(
                    "public queue {} needs slot_count > 0 and slot_size > {}",
                    def.queue_id, RECORD_PREFIX
                )));
            }
            if def.name.len() >= crate::Core::pool::QUEUE_NAME_LEN {
                return Err(IpcError::InvalidConfig(format!(
                    "public queue {} name is longer than {} bytes",
                    def.queue_id,
                    crate::Core::pool::QUEUE_NAME_LEN - 1
                )));
            }
        }
        Ok(())
    }

    /// Deterministic OS object name: `<namespace><purpose>_<name>_<id>`.
    pub fn object_name(&self, purpose: &str, name: &str, id: i32) -> String {
        format!("{}{}_{}_{}", self.namespace, purpose, name, id)
    }

    pub fn public_queue(&self, queue_id: i32) -> Option<&PublicQueueDef> {
        self.public_queues.iter().find(|q| q.queue_id == queue_id)
    }
}

lazy_static! {
    static ref INSTALLED: RwLock<Option<Arc<RuntimeConfig>>> = RwLock::new(None);
}

/// Configuration used by the process-wide pool and by public objects that are
/// opened without an explicit configuration.
pub fn current() -> Arc<RuntimeConfig> {
    if let Some(config) = INSTALLED.read().as_ref() {
        return Arc::clone(config);
    }
    let mut slot = INSTALLED.write();
    Arc::clone(slot.get_or_insert_with(|| Arc::new(RuntimeConfig::default())))
}

pub(crate) fn install(config: RuntimeConfig) -> Result<()> {
    config.validate()?;
    *INSTALLED.write() = Some(Arc::new(config));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.pool.max_mutexes, 1000);
        assert_eq!(config.pool.max_semaphores, 1000);
        assert_eq!(config.actor.queue_size, 16384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "pool": { "max_mutexes": 16 },
                 "public_queues": [ { "queue_id": 7, "slot_size": 16, "slot_count": 4 } ] }"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_mutexes, 16);
        assert_eq!(config.pool.max_semaphores, 1000);
        assert_eq!(config.public_queue(7).map(|q| q.slot_count), Some(4));
        assert!(config.public_queue(8).is_none());
    }

    #[test]
    fn duplicate_queue_ids_are_rejected() {
        let err = RuntimeConfig::from_json_str(
            r#"{ "public_queues": [
                 { "queue_id": 1, "slot_size": 16, "slot_count": 4 },
                 { "queue_id": 1, "slot_size": 32, "slot_count": 4 } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, IpcError::InvalidConfig(_)));
    }

    #[test]
    fn object_names_are_deterministic() {
        let config = RuntimeConfig::default();
        assert_eq!(config.object_name("shmem", "SynchObjects", 1), "dmxp_shmem_SynchObjects_1");
    }
}
