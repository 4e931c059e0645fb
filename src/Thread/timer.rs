// Timers are delivered as TIMER messages by one process-wide service thread.
// The service only ever does a non-blocking push into the target queue, so a
// stalled actor can lose ticks but never stall other timers.

use super::actor::ActorRef;
use crate::error::{IpcError, Result};
use crate::Queue::Structs::Queue_Structs::TIMER;
use crate::Queue::ThreadMessage;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct Armed {
    target: ActorRef,
    interval: Duration,
    periodic: bool,
    generation: u64,
}

#[derive(Default)]
struct Schedule {
    /// (due, timer id, generation); stale generations are skipped.
    queue: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    armed: HashMap<u64, Armed>,
    generation: u64,
    worker_started: bool,
}

struct TimerService {
    schedule: Mutex<Schedule>,
    wake: Condvar,
}

lazy_static! {
    static ref SERVICE: TimerService = TimerService {
        schedule: Mutex::new(Schedule::default()),
        wake: Condvar::new(),
    };
}

impl TimerService {
    fn arm(&'static self, id: u64, target: ActorRef, interval: Duration, periodic: bool) -> Result<()> {
        let mut schedule = self.schedule.lock();
        if !schedule.worker_started {
            std::thread::Builder::new()
                .name("dmxp-timer".into())
                .spawn(move || self.run())
                .map_err(|e| IpcError::os("spawn timer service", e))?;
            schedule.worker_started = true;
        }
        schedule.generation += 1;
        let generation = schedule.generation;
        schedule.armed.insert(
            id,
            Armed {
                target,
                interval,
                periodic,
                generation,
            },
        );
        schedule
            .queue
            .push(Reverse((Instant::now() + interval, id, generation)));
        self.wake.notify_one();
        Ok(())
    }

    fn disarm(&self, id: u64) -> bool {
        self.schedule.lock().armed.remove(&id).is_some()
    }

    fn is_armed(&self, id: u64) -> bool {
        self.schedule.lock().armed.contains_key(&id)
    }

    fn run(&self) {
        let mut schedule = self.schedule.lock();
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(Reverse((when, id, generation))) = schedule.queue.peek().copied() {
                if when > now {
                    break;
                }
                schedule.queue.pop();
                let Some(armed) = schedule.armed.get(&id) else {
                    continue;
                };
                if armed.generation != generation {
                    continue;
                }
                due.push((id, armed.target.clone()));
                if armed.periodic {
                    // A late tick is not replayed; the next one is a full interval away.
                    let mut next = when + armed.interval;
                    if next <= now {
                        next = now + armed.interval;
                    }
                    schedule.queue.push(Reverse((next, id, generation)));
                } else {
                    schedule.armed.remove(&id);
                }
            }

            if !due.is_empty() {
                drop(schedule);
                for (id, target) in due {
                    deliver(id, &target);
                }
                schedule = self.schedule.lock();
                continue;
            }

            match schedule.queue.peek().map(|Reverse((when, _, _))| *when) {
                Some(when) => {
                    self.wake.wait_until(&mut schedule, when);
                }
                None => self.wake.wait(&mut schedule),
            }
        }
    }
}

fn deliver(id: u64, target: &ActorRef) {
    match target.send_reserved(ThreadMessage::with_quad(TIMER, id as i64), false) {
        Ok(true) => {}
        Ok(false) => warn!(timer_id = id, thread_id = target.thread_id(), "actor queue full, timer tick dropped"),
        Err(e) => warn!(timer_id = id, thread_id = target.thread_id(), error = %e, "timer delivery failed"),
    }
}

/// Posts `TIMER` (data = timer id) to an actor after `interval`, once or
/// repeatedly. Dropping the timer stops it.
pub struct Timer {
    id: u64,
    target: ActorRef,
    interval: Duration,
    periodic: bool,
}

impl Timer {
    pub fn new(target: ActorRef, interval: Duration, periodic: bool) -> Self {
        Self {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            target,
            interval,
            periodic,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// Arm, or re-arm from now if already running.
    pub fn start(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(IpcError::InvalidConfig(format!("timer {} has a zero interval", self.id)));
        }
        SERVICE.arm(self.id, self.target.clone(), self.interval, self.periodic)?;
        debug!(timer_id = self.id, interval = ?self.interval, periodic = self.periodic, "timer started");
        Ok(())
    }

    /// Returns whether the timer was running.
    pub fn stop(&self) -> bool {
        SERVICE.disarm(self.id)
    }

    /// A one-shot timer stops being running once it has fired.
    pub fn is_running(&self) -> bool {
        SERVICE.is_armed(self.id)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("periodic", &self.periodic)
            .field("running", &self.is_running())
            .finish()
    }
}
