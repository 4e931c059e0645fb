// Fixed-size record carried by thread queues.

use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved lifecycle ids. Everything below `USER` belongs to the runtime.
pub const INIT: u32 = 1;
pub const QUIT: u32 = 2;
pub const SUSPEND: u32 = 3;
pub const TIMER: u32 = 4;
pub const SOCKET_ACCEPT: u32 = 5;
pub const SOCKET_CONNECT: u32 = 6;
pub const SOCKET_CLOSE: u32 = 7;
pub const SOCKET_ERROR: u32 = 8;
/// First id available to applications.
pub const USER: u32 = 10000;

/// One slot of a thread queue.
/// ABI-stable across languages; all fields are little-endian.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadMessage {
    pub msg_id: u32,
    pub reserved: u32,
    /// 8 bytes of inline data: a quad, or a (low u32, high i32) pair.
    pub data: u64,
    /// Stamped by the queue at push time.
    pub timestamp_ns: u64,
}

impl ThreadMessage {
    pub fn new(msg_id: u32) -> Self {
        Self {
            msg_id,
            ..Self::default()
        }
    }

    pub fn with_quad(msg_id: u32, quad: i64) -> Self {
        Self {
            msg_id,
            data: quad as u64,
            ..Self::default()
        }
    }

    pub fn with_parts(msg_id: u32, low: u32, high: i32) -> Self {
        Self {
            msg_id,
            data: ((high as u32 as u64) << 32) | low as u64,
            ..Self::default()
        }
    }

    pub fn quad(&self) -> i64 {
        self.data as i64
    }

    pub fn low(&self) -> u32 {
        self.data as u32
    }

    pub fn high(&self) -> i32 {
        (self.data >> 32) as u32 as i32
    }

    pub fn is_reserved(&self) -> bool {
        self.msg_id < USER
    }

    pub(crate) fn stamp(&mut self) {
        self.timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
    }
}
