// Public queues and pool handles in shared memory, including between two
// genuinely separate processes.
//
// The cross-process tests re-run this test binary with DMXP_CHILD_ROLE set;
// the `cross_process_child` test is a no-op unless that variable is present.
//
// Run with: cargo test --test public_queue -- --nocapture --test-threads=1

mod common;

use dmxp_ipc::config::RuntimeConfig;
use dmxp_ipc::error::PrimitiveKind;
use dmxp_ipc::Core::SharedPool;
use dmxp_ipc::Queue::{MessageQueue, QueueBuilder, QueueMode, ThreadQueue};
use dmxp_ipc::IpcError;
use std::process::{Command, Stdio};
use std::sync::Arc;

const ROLE_VAR: &str = "DMXP_CHILD_ROLE";
const NAMESPACE_VAR: &str = "DMXP_CHILD_NAMESPACE";
const HANDLE_VAR: &str = "DMXP_CHILD_HANDLE";

const SCENARIO_QUEUE: i32 = 1;
const CROSS_QUEUE: i32 = 2;

fn shared_config(namespace: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.namespace = namespace.to_string();
    config.pool.max_mutexes = 16;
    config.pool.max_semaphores = 16;
    config.public_queues = vec![
        common::queue_def(SCENARIO_QUEUE, 16, 4, false, false),
        common::queue_def(CROSS_QUEUE, 32, 8, false, true),
    ];
    config
}

fn pool_for(tag: &str) -> (String, Arc<SharedPool>) {
    common::init_tracing();
    let namespace = format!("dmxp_t{}_{}_", std::process::id(), tag);
    let pool = SharedPool::open(&shared_config(&namespace)).unwrap();
    (namespace, pool)
}

fn run_child(role: &str, namespace: &str, handle: Option<i32>) {
    let exe = std::env::current_exe().unwrap();
    let mut cmd = Command::new(exe);
    cmd.args(["cross_process_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(ROLE_VAR, role)
        .env(NAMESPACE_VAR, namespace);
    if let Some(handle) = handle {
        cmd.env(HANDLE_VAR, handle.to_string());
    }
    let status = cmd.status().unwrap();
    assert!(status.success(), "child role {} failed: {}", role, status);
}

#[test]
fn test_full_queue_scenario() {
    let (_, pool) = pool_for("scenario");
    let writer = MessageQueue::<String>::open_public_in(&pool, SCENARIO_QUEUE, QueueMode::WriteOnly).unwrap();
    let reader = MessageQueue::<String>::open_public_in(&pool, SCENARIO_QUEUE, QueueMode::ReadOnly).unwrap();
    assert!(writer.is_public());

    for i in 0..4 {
        assert!(writer.push(&format!("m{}", i), false).unwrap());
    }
    assert!(!writer.push(&"m4".to_string(), false).unwrap());
    assert!(!writer.push(&"m4".to_string(), false).unwrap());

    let mut popped = vec![reader.pop(false).unwrap().unwrap()];
    assert!(writer.push(&"m4".to_string(), false).unwrap());
    while let Some(m) = reader.pop(false).unwrap() {
        popped.push(m);
    }
    assert_eq!(popped, ["m0", "m1", "m2", "m3", "m4"]);
}

#[test]
fn test_registration_rules_span_handles() {
    let (_, pool) = pool_for("rules");
    let writer = MessageQueue::<u32>::open_public_in(&pool, SCENARIO_QUEUE, QueueMode::WriteOnly).unwrap();
    assert!(matches!(
        MessageQueue::<u32>::open_public_in(&pool, SCENARIO_QUEUE, QueueMode::ReadWrite),
        Err(IpcError::MultipleWritersNotAllowed { .. })
    ));
    drop(writer);
    let rw = MessageQueue::<u32>::open_public_in(&pool, SCENARIO_QUEUE, QueueMode::ReadWrite).unwrap();
    rw.push(&3, false).unwrap();
    assert_eq!(rw.pop(false).unwrap(), Some(3));

    assert!(matches!(
        MessageQueue::<u32>::open_public_in(&pool, 99, QueueMode::ReadOnly),
        Err(IpcError::QueueNotFound { queue_id: 99 })
    ));
}

#[test]
fn test_last_close_returns_queue_objects() {
    let (_, pool) = pool_for("release");
    let before = pool.usage(PrimitiveKind::Mutex).curr_used;
    {
        let q = MessageQueue::<u32>::open_public_in(&pool, CROSS_QUEUE, QueueMode::ReadWrite).unwrap();
        let _second = q.reopen(QueueMode::WriteOnly).unwrap();
        assert_eq!(pool.usage(PrimitiveKind::Mutex).curr_used, before + 2);
        assert_eq!(pool.usage(PrimitiveKind::Semaphore).curr_used, 2);
    }
    assert_eq!(pool.usage(PrimitiveKind::Mutex).curr_used, before);
    assert_eq!(pool.usage(PrimitiveKind::Semaphore).curr_used, 0);

    // A fresh open initializes again from scratch.
    let q = MessageQueue::<u32>::open_public_in(&pool, CROSS_QUEUE, QueueMode::ReadWrite).unwrap();
    assert_eq!(q.messages(), 0);
    assert_eq!(q.free_slots(), 8);
}

#[test]
fn test_geometry_mismatch_is_rejected() {
    let (_, pool) = pool_for("geometry");
    let _q = MessageQueue::<u32>::open_public_in(&pool, SCENARIO_QUEUE, QueueMode::ReadOnly).unwrap();
    let err = QueueBuilder::new()
        .with_queue_id(SCENARIO_QUEUE)
        .with_name(format!("q{}", SCENARIO_QUEUE))
        .with_slot_size(16)
        .with_slot_count(8)
        .with_pool(Arc::clone(&pool))
        .build::<u32>()
        .unwrap_err();
    assert!(matches!(err, IpcError::InvalidConfig(_)));
}

#[test]
fn test_public_thread_queue_has_a_segment() {
    let (namespace, pool) = pool_for("threadq");
    let q = ThreadQueue::open_public_in(&pool, 10_001, 16, QueueMode::ReadWrite).unwrap();
    let name = q.segment_name().unwrap().to_string();
    assert!(name.starts_with(&namespace));
    assert!(common::shm_exists(&name));
    drop(q);
    assert!(!common::shm_exists(&name));
}

#[test]
fn test_pool_handle_shared_with_child_process() {
    let (namespace, pool) = pool_for("xpool");
    let handle = pool.next_mutex().unwrap();
    let _guard = pool.mutex(handle).unwrap().lock().unwrap();

    // The child sees the mutex held and cannot take it.
    run_child("pool_busy", &namespace, Some(handle));

    drop(_guard);
    pool.free_mutex(handle).unwrap();

    // The freed handle is the next one the child allocates.
    run_child("pool_reuse", &namespace, Some(handle));
    assert!(pool.mutex(handle).is_err());
}

#[test]
fn test_public_queue_between_processes() {
    let (namespace, pool) = pool_for("xqueue");
    let reader = MessageQueue::<String>::open_public_in(&pool, CROSS_QUEUE, QueueMode::ReadOnly).unwrap();

    run_child("queue_writer", &namespace, None);

    let received: Vec<String> = std::iter::from_fn(|| reader.pop(false).unwrap()).collect();
    assert_eq!(received, ["child-0", "child-1", "child-2"]);
}

#[test]
fn test_processes_racing_to_create_the_pool() {
    common::init_tracing();
    let namespace = format!("dmxp_t{}_xrace_", std::process::id());
    let exe = std::env::current_exe().unwrap();
    let children: Vec<_> = (0..3)
        .map(|_| {
            Command::new(&exe)
                .args(["cross_process_child", "--exact", "--nocapture", "--test-threads=1", "--quiet"])
                .env(ROLE_VAR, "pool_race")
                .env(NAMESPACE_VAR, &namespace)
                .stdout(Stdio::piped())
                .spawn()
                .unwrap()
        })
        .collect();

    let mut handles = Vec::new();
    for child in children {
        let output = child.wait_with_output().unwrap();
        assert!(output.status.success(), "pool_race child failed: {}", output.status);
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(h) = line.strip_prefix("pool_race handle=") {
                handles.push(h.trim().parse::<i32>().unwrap());
            }
        }
    }
    assert_eq!(handles.len(), 3);
    handles.sort_unstable();
    handles.dedup();
    assert_eq!(handles.len(), 3, "children held the same mutex handle");
}

#[test]
fn cross_process_child() {
    let Ok(role) = std::env::var(ROLE_VAR) else {
        return;
    };
    common::init_tracing();
    let namespace = std::env::var(NAMESPACE_VAR).unwrap();
    let pool = SharedPool::open(&shared_config(&namespace)).unwrap();
    let handle = std::env::var(HANDLE_VAR).ok().map(|h| h.parse::<i32>().unwrap());

    match role.as_str() {
        "pool_busy" => {
            let mutex = pool.mutex(handle.unwrap()).unwrap();
            assert!(mutex.is_locked());
            assert!(!mutex.acquire(false).unwrap());
        }
        "pool_reuse" => {
            let fresh = pool.next_mutex().unwrap();
            assert_eq!(Some(fresh), handle);
            assert!(pool.mutex(fresh).unwrap().lock().is_ok());
            pool.free_mutex(fresh).unwrap();
        }
        "queue_writer" => {
            let writer = MessageQueue::<String>::open_public_in(&pool, CROSS_QUEUE, QueueMode::WriteOnly).unwrap();
            for i in 0..3 {
                assert!(writer.push(&format!("child-{}", i), false).unwrap());
            }
        }
        "pool_race" => {
            // Every racer must see a fully initialised pool with the queue table.
            assert!(pool.is_initialized());
            assert_eq!(pool.public_queue(CROSS_QUEUE).unwrap().slot_size, 32);
            let mutex = pool.next_mutex().unwrap();
            println!("pool_race handle={}", mutex);
            std::thread::sleep(std::time::Duration::from_millis(500));
            pool.free_mutex(mutex).unwrap();
        }
        other => panic!("unknown child role {}", other),
    }
}
