// Layout conformance tests for the control blocks that live in shared
// memory and are read by processes built separately (including the C API).
// They assert sizes, alignments and field offsets, and print the observed
// values to aid debugging when a mismatch occurs on a given platform.
// Run with: cargo test --test layout -- --nocapture

use dmxp_ipc::Core::pool::{FreeListCtrl, PoolHeader, QueueDefEntry, QUEUE_NAME_LEN};
use dmxp_ipc::Core::SharedMemory::{SegmentHeader, HEADER_SIZE};
use dmxp_ipc::Queue::layout::{QueueCtrl, SLOTS_OFFSET};
use dmxp_ipc::Queue::{ThreadMessage, THREAD_SLOT_SIZE};
use memoffset::offset_of;
use std::mem::{align_of, size_of};

#[test]
fn test_thread_message_layout() {
    let size = size_of::<ThreadMessage>();
    let align = align_of::<ThreadMessage>();
    let off_msg_id = offset_of!(ThreadMessage, msg_id);
    let off_reserved = offset_of!(ThreadMessage, reserved);
    let off_data = offset_of!(ThreadMessage, data);
    let off_timestamp_ns = offset_of!(ThreadMessage, timestamp_ns);

    println!(
        "ThreadMessage => size: {size}, align: {align}, offsets: [msg_id:{off_msg_id}, reserved:{off_reserved}, data:{off_data}, timestamp_ns:{off_timestamp_ns}]"
    );

    assert_eq!(size, 24);
    assert_eq!(THREAD_SLOT_SIZE, 24);
    assert_eq!(align, align_of::<u64>());
    assert_eq!(off_msg_id, 0);
    assert_eq!(off_reserved, 4);
    assert_eq!(off_data, 8);
    assert_eq!(off_timestamp_ns, 16);
}

#[test]
fn test_queue_ctrl_layout() {
    let off_head = offset_of!(QueueCtrl, head);
    let off_tail = offset_of!(QueueCtrl, tail);
    println!(
        "QueueCtrl => size: {}, align: {}, head: {off_head}, tail: {off_tail}, slots at: {SLOTS_OFFSET}",
        size_of::<QueueCtrl>(),
        align_of::<QueueCtrl>()
    );

    assert_eq!(align_of::<QueueCtrl>(), 128);
    assert_eq!(offset_of!(QueueCtrl, initialized), 0);
    assert_eq!(offset_of!(QueueCtrl, queue_id), 4);
    assert_eq!(offset_of!(QueueCtrl, sem_msgs), 48);
    // Writers and readers never share a cache line over the cursors.
    assert!(off_head >= 64);
    assert!(off_tail - off_head >= 64);
    assert_eq!(SLOTS_OFFSET % 128, 0);
    assert!(SLOTS_OFFSET >= size_of::<QueueCtrl>());
}

#[test]
fn test_segment_header_layout() {
    println!(
        "SegmentHeader => size: {}, align: {}, reserved: {HEADER_SIZE}",
        size_of::<SegmentHeader>(),
        align_of::<SegmentHeader>()
    );
    assert_eq!(align_of::<SegmentHeader>(), 128);
    assert_eq!(offset_of!(SegmentHeader, magic), 0);
    assert_eq!(offset_of!(SegmentHeader, mutex), 8);
    assert_eq!(HEADER_SIZE % 128, 0);
    assert!(HEADER_SIZE >= size_of::<SegmentHeader>());
}

#[test]
fn test_pool_header_layout() {
    assert_eq!(align_of::<PoolHeader>(), 128);
    assert_eq!(offset_of!(PoolHeader, initialized), 0);
    assert_eq!(offset_of!(PoolHeader, semaphores), 16);
    assert_eq!(
        offset_of!(PoolHeader, mutexes),
        16 + size_of::<FreeListCtrl>()
    );
    assert_eq!(size_of::<FreeListCtrl>(), 24);

    assert_eq!(offset_of!(QueueDefEntry, name), 16);
    assert_eq!(size_of::<QueueDefEntry>(), 16 + QUEUE_NAME_LEN);
}
