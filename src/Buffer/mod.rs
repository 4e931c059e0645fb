pub mod Buffer;
pub mod Buffer_impl;

pub use Buffer::RingBuffer; // re-export for stable path
pub(crate) use Buffer_impl::{copy_from_ring, copy_into_ring};
