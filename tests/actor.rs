// Actor threads: lifecycle, suspend/resume ordering, dispatch chains and
// handler failures.
// Run with: cargo test --test actor -- --nocapture

mod common;

use dmxp_ipc::error::Result;
use dmxp_ipc::message_map;
use dmxp_ipc::Thread::{
    lifecycle_map, pump_message, Actor, ActorContext, ActorOptions, ActorRef, ActorThread,
    MessageMap, PumpStatus, RunState, ThreadMessage, INIT, QUIT, SUSPEND, USER,
};
use dmxp_ipc::IpcError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PING: u32 = USER + 1;
const FAIL: u32 = USER + 2;
const STOP: u32 = USER + 3;
const SHADOWED: u32 = USER + 4;

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    log: Log,
}

impl Recorder {
    fn new() -> (Self, Log) {
        let log: Log = Arc::default();
        (Self { log: Arc::clone(&log) }, log)
    }

    fn note(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    fn ping(&mut self, _ctx: &ActorContext, value: i64) -> Result<()> {
        self.note(format!("ping {}", value));
        Ok(())
    }

    fn fail(&mut self, _ctx: &ActorContext) -> Result<()> {
        self.note("fail");
        Err(IpcError::Handler("refused".into()))
    }

    fn stop(&mut self, ctx: &ActorContext) -> Result<()> {
        self.note("stop");
        ctx.quit()
    }

    fn base_shadowed(&mut self, _ctx: &ActorContext) -> Result<()> {
        self.note("base");
        Ok(())
    }
}

impl Actor for Recorder {
    fn message_map() -> &'static MessageMap<Self> {
        message_map!(Recorder, {
            on_value PING => Recorder::ping,
            on_notify FAIL => Recorder::fail,
            on_notify STOP => Recorder::stop,
        })
    }

    fn on_init(&mut self, ctx: &ActorContext) -> Result<()> {
        self.note(format!("init {}", ctx.thread_id()));
        Ok(())
    }

    fn on_quit(&mut self, _ctx: &ActorContext) -> Result<()> {
        self.note("quit");
        Ok(())
    }

    fn on_suspend(&mut self, _ctx: &ActorContext) -> Result<()> {
        self.note("suspend");
        Ok(())
    }

    fn default_handler(&mut self, _ctx: &ActorContext, message: &ThreadMessage) -> Result<()> {
        self.note(format!("default {}", message.msg_id));
        Ok(())
    }
}

fn wait_for(log: &Log, len: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().len() < len {
        assert!(Instant::now() < deadline, "timed out waiting for {} entries: {:?}", len, log.lock());
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn options(name: &str) -> ActorOptions {
    ActorOptions::new(name, 5).with_queue_size(64)
}

#[test]
fn test_init_quit_join() {
    common::init_tracing();
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(actor, options("lifecycle")).unwrap();
    assert_eq!(thread.run_state(), RunState::WaitingToRun);
    thread.init().unwrap();
    assert!(matches!(thread.init(), Err(IpcError::AlreadyInitialized { .. })));

    thread.post(PING, 11).unwrap();
    thread.quit().unwrap();
    thread.join().unwrap();
    assert_eq!(thread.run_state(), RunState::DoneRunning);
    assert_eq!(*log.lock(), ["init 5", "ping 11", "quit"]);
}

#[test]
fn test_messages_sent_while_suspended_wait_for_resume() {
    common::init_tracing();
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(actor, options("suspend")).unwrap();
    thread.init().unwrap();
    wait_for(&log, 1);

    thread.suspend().unwrap();
    thread.suspend().unwrap();
    assert_eq!(thread.suspend_count(), 2);
    for v in 1..=3 {
        thread.post(PING, v).unwrap();
    }
    wait_for(&log, 2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*log.lock(), ["init 5", "suspend"]);

    // Nested: the first resume only counts down.
    thread.resume().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(log.lock().len(), 2);

    thread.resume().unwrap();
    wait_for(&log, 5);
    assert_eq!(log.lock()[2..], ["ping 1", "ping 2", "ping 3"]);
    thread.quit().unwrap();
    thread.join().unwrap();
}

#[test]
fn test_created_suspended_waits_for_start() {
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(actor, options("gated").suspended(true)).unwrap();
    thread.init().unwrap();
    thread.post(PING, 1).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert!(log.lock().is_empty());
    assert_eq!(thread.run_state(), RunState::WaitingToRun);

    // resume only undoes suspend; it does not start the thread.
    thread.resume().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(thread.run_state(), RunState::WaitingToRun);
    assert_eq!(thread.suspend_count(), 0);

    thread.start().unwrap();
    wait_for(&log, 2);
    assert_eq!(*log.lock(), ["init 5", "ping 1"]);
    thread.start().unwrap();
    thread.quit().unwrap();
    thread.join().unwrap();
}

#[test]
fn test_suspend_resume_before_start_leaves_pump_running() {
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(actor, options("gated_pair").suspended(true)).unwrap();
    thread.init().unwrap();
    thread.suspend().unwrap();
    thread.resume().unwrap();
    assert_eq!(thread.suspend_count(), 0);
    thread.post(PING, 1).unwrap();

    thread.start().unwrap();
    wait_for(&log, 3);
    assert_eq!(*log.lock(), ["init 5", "suspend", "ping 1"]);
    thread.quit().unwrap();
    thread.join().unwrap();
}

#[test]
fn test_handler_error_stops_the_pump() {
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(actor, options("failing")).unwrap();
    thread.init().unwrap();
    thread.send_message(ThreadMessage::new(FAIL), true).unwrap();
    thread.post(PING, 1).unwrap();

    assert!(matches!(thread.join(), Err(IpcError::Handler(_))));
    assert_eq!(thread.run_state(), RunState::DoneRunning);
    assert_eq!(*log.lock(), ["init 5", "fail"]);
}

#[test]
fn test_quit_from_a_handler_runs_on_quit() {
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(actor, options("self-stop")).unwrap();
    thread.init().unwrap();
    thread.send_message(ThreadMessage::new(STOP), true).unwrap();
    thread.join().unwrap();
    assert_eq!(*log.lock(), ["init 5", "stop", "quit"]);
}

#[test]
fn test_reserved_ids_cannot_be_sent() {
    let (actor, _log) = Recorder::new();
    let thread = ActorThread::new(actor, options("reserved")).unwrap();
    for id in [INIT, QUIT, SUSPEND, 9999] {
        assert!(matches!(
            thread.send_message(ThreadMessage::new(id), false),
            Err(IpcError::ReservedMessageId(i)) if i == id
        ));
    }
}

struct Derived {
    inner: Recorder,
}

impl Derived {
    fn ping_twice(&mut self, _ctx: &ActorContext, value: i64) -> Result<()> {
        self.inner.note(format!("derived ping {}", value * 2));
        Ok(())
    }
}

fn base_map() -> MessageMap<Derived> {
    MessageMap::new()
        .on_value(PING, |a: &mut Derived, ctx, v| a.inner.ping(ctx, v))
        .on_notify(SHADOWED, |a: &mut Derived, ctx| a.inner.base_shadowed(ctx))
        .inherit(lifecycle_map::<Derived>())
}

impl Actor for Derived {
    fn message_map() -> &'static MessageMap<Self> {
        message_map!(Derived, base = base_map(), {
            on_value PING => Derived::ping_twice,
        })
    }

    fn on_init(&mut self, ctx: &ActorContext) -> Result<()> {
        self.inner.on_init(ctx)
    }

    fn default_handler(&mut self, ctx: &ActorContext, message: &ThreadMessage) -> Result<()> {
        self.inner.default_handler(ctx, message)
    }
}

#[test]
fn test_derived_table_overrides_then_falls_back() {
    let map = Derived::message_map();
    assert_eq!(map.depth(), 3);
    assert_eq!(map.len(), 1);
    assert!(map.lookup(SHADOWED).is_some());
    assert!(map.lookup(USER + 99).is_none());

    let (inner, log) = Recorder::new();
    let mut actor = Derived { inner };
    let ctx = ActorContext::private(8, 16).unwrap();
    assert_eq!(pump_message(&mut actor, &ctx, false).unwrap(), PumpStatus::Dispatched(INIT));
    assert_eq!(pump_message(&mut actor, &ctx, false).unwrap(), PumpStatus::Idle);

    let sender: ActorRef = ctx.sender();
    sender.post(PING, 4).unwrap();
    sender.send_message(ThreadMessage::new(SHADOWED), false).unwrap();
    sender.send_message(ThreadMessage::new(USER + 99), false).unwrap();
    sender.quit().unwrap();
    while pump_message(&mut actor, &ctx, false).unwrap() != PumpStatus::Quit {}

    let expected = vec![
        "init 8".to_string(),
        "derived ping 8".to_string(),
        "base".to_string(),
        format!("default {}", USER + 99),
    ];
    assert_eq!(*log.lock(), expected);
}

#[test]
#[serial_test::serial]
fn test_public_actor_reachable_by_id() {
    common::init_tracing();
    common::install_global(common::test_config("actor_global"));
    let (actor, log) = Recorder::new();
    let thread = ActorThread::new(
        actor,
        ActorOptions::new("public", 7).public(true).with_app_id(3),
    )
    .unwrap();
    assert!(thread.queue().is_public());
    assert_eq!(thread.queue().queue_id(), 30_007);
    thread.init().unwrap();

    let remote = ActorRef::open_public(3, 7).unwrap();
    assert_eq!(remote.queue_id(), 30_007);
    remote.post(PING, 99).unwrap();
    remote.quit().unwrap();
    thread.join().unwrap();
    assert_eq!(*log.lock(), ["init 7", "ping 99", "quit"]);
}
