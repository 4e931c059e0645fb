// Timers posting TIMER messages into actor queues.
// Run with: cargo test --test timer -- --nocapture

mod common;

use dmxp_ipc::error::Result;
use dmxp_ipc::message_map;
use dmxp_ipc::Thread::{
    pump_message, Actor, ActorContext, ActorOptions, ActorThread, MessageMap, PumpStatus, Timer,
    USER,
};
use dmxp_ipc::IpcError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const START_TIMER: u32 = USER + 1;

#[derive(Default)]
struct Ticker {
    ticks: Arc<Mutex<Vec<u64>>>,
    timer: Option<Timer>,
    quit_after: usize,
}

impl Ticker {
    fn start_timer(&mut self, ctx: &ActorContext, interval_ms: i64) -> Result<()> {
        let timer = ctx.create_timer(Duration::from_millis(interval_ms as u64), true);
        timer.start()?;
        self.timer = Some(timer);
        Ok(())
    }
}

impl Actor for Ticker {
    fn message_map() -> &'static MessageMap<Self> {
        message_map!(Ticker, {
            on_value START_TIMER => Ticker::start_timer,
        })
    }

    fn on_timer(&mut self, ctx: &ActorContext, timer_id: u64) -> Result<()> {
        let count = {
            let mut ticks = self.ticks.lock();
            ticks.push(timer_id);
            ticks.len()
        };
        if self.quit_after > 0 && count == self.quit_after {
            ctx.quit()?;
        }
        Ok(())
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_one_shot_fires_once() {
    common::init_tracing();
    let ticks: Arc<Mutex<Vec<u64>>> = Arc::default();
    let thread = ActorThread::new(
        Ticker {
            ticks: Arc::clone(&ticks),
            ..Ticker::default()
        },
        ActorOptions::new("one-shot", 1).with_queue_size(16),
    )
    .unwrap();
    thread.init().unwrap();

    let timer = Timer::new(thread.sender(), Duration::from_millis(10), false);
    assert!(!timer.is_running());
    timer.start().unwrap();
    assert!(timer.is_running());

    wait_until(|| !ticks.lock().is_empty());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*ticks.lock(), [timer.id()]);
    assert!(!timer.is_running());
    assert!(!timer.stop());
}

#[test]
fn test_periodic_timer_until_stopped() {
    let ticks: Arc<Mutex<Vec<u64>>> = Arc::default();
    let thread = ActorThread::new(
        Ticker {
            ticks: Arc::clone(&ticks),
            ..Ticker::default()
        },
        ActorOptions::new("periodic", 2).with_queue_size(16),
    )
    .unwrap();
    thread.init().unwrap();

    let timer = Timer::new(thread.sender(), Duration::from_millis(5), true);
    timer.start().unwrap();
    wait_until(|| ticks.lock().len() >= 3);
    assert!(timer.stop());
    assert!(!timer.is_running());

    // A tick already taken off the schedule may still land.
    std::thread::sleep(Duration::from_millis(30));
    let settled = ticks.lock().len();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(ticks.lock().len(), settled);
    assert!(ticks.lock().iter().all(|id| *id == timer.id()));
}

#[test]
fn test_timer_created_from_a_handler_drives_quit() {
    let ticks: Arc<Mutex<Vec<u64>>> = Arc::default();
    let thread = ActorThread::new(
        Ticker {
            ticks: Arc::clone(&ticks),
            timer: None,
            quit_after: 3,
        },
        ActorOptions::new("self-timed", 3).with_queue_size(16),
    )
    .unwrap();
    thread.init().unwrap();
    thread.post(START_TIMER, 5).unwrap();
    thread.join().unwrap();
    assert!(ticks.lock().len() >= 3);
}

#[test]
fn test_full_queue_drops_ticks() {
    let mut actor = Ticker::default();
    let ctx = ActorContext::private(4, 2).unwrap();
    // INIT plus one filler leaves no room for a tick.
    ctx.sender().post(USER + 50, 0).unwrap();

    let timer = ctx.create_timer(Duration::from_millis(5), false);
    timer.start().unwrap();
    wait_until(|| !timer.is_running());
    // Delivery happens just after the timer is disarmed.
    std::thread::sleep(Duration::from_millis(50));

    let mut statuses = Vec::new();
    loop {
        match pump_message(&mut actor, &ctx, false).unwrap() {
            PumpStatus::Idle => break,
            status => statuses.push(status),
        }
    }
    assert_eq!(statuses.len(), 2);
    assert!(actor.ticks.lock().is_empty());
}

#[test]
fn test_zero_interval_is_rejected() {
    let ctx = ActorContext::private(5, 4).unwrap();
    let timer = ctx.create_timer(Duration::ZERO, true);
    assert!(matches!(timer.start(), Err(IpcError::InvalidConfig(_))));
    assert!(!timer.is_running());
}
