use super::basic::{RunState, ThreadBasic};
use super::dispatch::MessageMap;
use super::timer::Timer;
use crate::config;
use crate::error::{IpcError, Result};
use crate::Queue::Structs::Queue_Structs::{INIT, QUIT, SUSPEND, USER};
use crate::Queue::{QueueMode, ThreadMessage, ThreadQueue};
use crate::Synch::{SemaphoreOps, SemaphorePrivate};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Thread ids per application when deriving public queue ids.
pub const THREADS_PER_APP: i32 = 10000;

const QUIT_GRACE: Duration = Duration::from_millis(50);

/// Application logic run by an `ActorThread`. Every hook runs on the
/// actor's own thread, one message at a time.
pub trait Actor: Send + Sized + 'static {
    fn message_map() -> &'static MessageMap<Self>;

    fn on_init(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    fn on_quit(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    /// Runs before the pump parks until `resume`.
    fn on_suspend(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    fn on_timer(&mut self, _ctx: &ActorContext, _timer_id: u64) -> Result<()> {
        Ok(())
    }

    /// Called for ids no table in the chain handles.
    fn default_handler(&mut self, _ctx: &ActorContext, message: &ThreadMessage) -> Result<()> {
        debug!(msg_id = message.msg_id, "unhandled message");
        Ok(())
    }
}

/// Cloneable sending end of an actor's queue.
#[derive(Clone)]
pub struct ActorRef {
    queue: Arc<ThreadQueue>,
    thread_id: i32,
}

impl ActorRef {
    /// Attach to the public queue of actor `thread_id` in application
    /// `app_id`, possibly owned by another process.
    pub fn open_public(app_id: i32, thread_id: i32) -> Result<Self> {
        let queue_size = config::current().actor.queue_size;
        let queue = ThreadQueue::open_public(public_queue_id(app_id, thread_id), queue_size, QueueMode::WriteOnly)?;
        Ok(Self {
            queue: Arc::new(queue),
            thread_id,
        })
    }

    /// Queue a user message. Ids below `USER` are refused.
    pub fn send_message(&self, message: ThreadMessage, wait: bool) -> Result<bool> {
        if message.msg_id < USER {
            return Err(IpcError::ReservedMessageId(message.msg_id));
        }
        self.queue.push(message, wait)
    }

    pub fn post(&self, msg_id: u32, data: i64) -> Result<bool> {
        self.send_message(ThreadMessage::with_quad(msg_id, data), true)
    }

    pub(crate) fn send_reserved(&self, message: ThreadMessage, wait: bool) -> Result<bool> {
        self.queue.push(message, wait)
    }

    pub fn quit(&self) -> Result<()> {
        self.send_reserved(ThreadMessage::new(QUIT), true).map(|_| ())
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id
    }

    pub fn queue_id(&self) -> i32 {
        self.queue.queue_id()
    }
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("thread_id", &self.thread_id)
            .field("queue", &self.queue)
            .finish()
    }
}

pub fn public_queue_id(app_id: i32, thread_id: i32) -> i32 {
    app_id * THREADS_PER_APP + thread_id
}

pub(crate) struct SuspendState {
    count: AtomicI32,
    sem: SemaphorePrivate,
}

/// Handed to every handler: the actor's own queue and identity.
pub struct ActorContext {
    sender: ActorRef,
    suspend: Arc<SuspendState>,
    quit_pending: AtomicBool,
}

impl ActorContext {
    /// A context over a fresh private queue with `INIT` already queued, for
    /// pumping an actor on the calling thread with `pump_message`.
    pub fn private(thread_id: i32, queue_size: usize) -> Result<Self> {
        let queue = ThreadQueue::open_private(thread_id, queue_size, QueueMode::ReadWrite)?;
        queue.push(ThreadMessage::new(INIT), false)?;
        Ok(Self::new(Arc::new(queue), thread_id, new_suspend_state()))
    }

    fn new(queue: Arc<ThreadQueue>, thread_id: i32, suspend: Arc<SuspendState>) -> Self {
        Self {
            sender: ActorRef { queue, thread_id },
            suspend,
            quit_pending: AtomicBool::new(false),
        }
    }

    pub fn sender(&self) -> ActorRef {
        self.sender.clone()
    }

    pub fn thread_id(&self) -> i32 {
        self.sender.thread_id
    }

    /// Stop the pump after the current message. Queues a `QUIT` when there
    /// is room so `on_quit` runs in order; otherwise the pump synthesizes it.
    pub fn quit(&self) -> Result<()> {
        if !self.sender.send_reserved(ThreadMessage::new(QUIT), false)? {
            self.quit_pending.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// A stopped timer that will post `TIMER` messages to this actor.
    pub fn create_timer(&self, interval: Duration, periodic: bool) -> Timer {
        Timer::new(self.sender(), interval, periodic)
    }

    fn queue(&self) -> &ThreadQueue {
        &self.sender.queue
    }
}

fn new_suspend_state() -> Arc<SuspendState> {
    Arc::new(SuspendState {
        count: AtomicI32::new(0),
        sem: SemaphorePrivate::new(0, 0),
    })
}

/// Outcome of one `pump_message` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Nothing queued and `wait` was false.
    Idle,
    Dispatched(u32),
    /// `QUIT` was dispatched; the pump must stop.
    Quit,
}

/// Pop one message and dispatch it through the actor's table chain.
pub fn pump_message<A: Actor>(actor: &mut A, ctx: &ActorContext, wait: bool) -> Result<PumpStatus> {
    if ctx.quit_pending.swap(false, Ordering::AcqRel) {
        dispatch(actor, ctx, &ThreadMessage::new(QUIT))?;
        return Ok(PumpStatus::Quit);
    }
    let message = match ctx.queue().pop(wait)? {
        Some(message) => message,
        None => return Ok(PumpStatus::Idle),
    };
    dispatch(actor, ctx, &message)?;
    match message.msg_id {
        QUIT => Ok(PumpStatus::Quit),
        SUSPEND => {
            ctx.suspend.sem.decrement(true)?;
            Ok(PumpStatus::Dispatched(SUSPEND))
        }
        id => Ok(PumpStatus::Dispatched(id)),
    }
}

fn dispatch<A: Actor>(actor: &mut A, ctx: &ActorContext, message: &ThreadMessage) -> Result<()> {
    match A::message_map().lookup(message.msg_id) {
        Some(handler) => handler.invoke(actor, ctx, message),
        None => actor.default_handler(ctx, message),
    }
}

#[derive(Debug, Clone)]
pub struct ActorOptions {
    pub name: String,
    pub thread_id: i32,
    /// Back the queue with a public segment so other processes can send.
    pub public: bool,
    pub app_id: Option<i32>,
    /// Slot count; defaults to the configured actor queue size.
    pub queue_size: Option<usize>,
    pub stack_size: usize,
    pub suspended: bool,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            name: "actor".into(),
            thread_id: 0,
            public: false,
            app_id: None,
            queue_size: None,
            stack_size: 0,
            suspended: false,
        }
    }
}

impl ActorOptions {
    pub fn new(name: impl Into<String>, thread_id: i32) -> Self {
        Self {
            name: name.into(),
            thread_id,
            ..Self::default()
        }
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_app_id(mut self, app_id: i32) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }
}

/// An OS thread that owns an `Actor` and pumps its queue.
pub struct ActorThread<A: Actor> {
    thread: ThreadBasic,
    queue: Arc<ThreadQueue>,
    suspend: Arc<SuspendState>,
    actor: Mutex<Option<A>>,
    options: ActorOptions,
}

impl<A: Actor> ActorThread<A> {
    pub fn new(actor: A, options: ActorOptions) -> Result<Self> {
        let runtime = config::current();
        let queue_size = options.queue_size.unwrap_or(runtime.actor.queue_size);
        let queue = if options.public {
            let app_id = options.app_id.unwrap_or(runtime.actor.app_id);
            ThreadQueue::open_public(
                public_queue_id(app_id, options.thread_id),
                queue_size,
                QueueMode::ReadWrite,
            )?
        } else {
            ThreadQueue::open_private(options.thread_id, queue_size, QueueMode::ReadWrite)?
        };
        Ok(Self {
            thread: ThreadBasic::new(options.name.clone()),
            queue: Arc::new(queue),
            suspend: new_suspend_state(),
            actor: Mutex::new(Some(actor)),
            options,
        })
    }

    /// Start the pump. `INIT` is queued first, so `on_init` runs on the
    /// actor's thread before anything sent afterwards.
    pub fn init(&self) -> Result<()> {
        let mut actor = self
            .actor
            .lock()
            .take()
            .ok_or(IpcError::AlreadyInitialized { what: "actor thread" })?;
        self.queue.push(ThreadMessage::new(INIT), true)?;

        let ctx = ActorContext::new(Arc::clone(&self.queue), self.options.thread_id, Arc::clone(&self.suspend));
        let name = self.options.name.clone();
        self.thread
            .init(self.options.suspended, self.options.stack_size, move || {
                debug!(actor = %name, "message pump started");
                loop {
                    match pump_message(&mut actor, &ctx, true) {
                        Ok(PumpStatus::Quit) => break,
                        Ok(_) => {}
                        Err(e) if e.is_cancelled() => {
                            debug!(actor = %name, "message pump cancelled");
                            break;
                        }
                        Err(e) => {
                            error!(actor = %name, error = %e, "message handler failed, stopping actor");
                            return Err(e);
                        }
                    }
                }
                debug!(actor = %name, "message pump stopped");
                Ok(())
            })
    }

    pub fn sender(&self) -> ActorRef {
        ActorRef {
            queue: Arc::clone(&self.queue),
            thread_id: self.options.thread_id,
        }
    }

    pub fn send_message(&self, message: ThreadMessage, wait: bool) -> Result<bool> {
        self.sender().send_message(message, wait)
    }

    pub fn post(&self, msg_id: u32, data: i64) -> Result<bool> {
        self.sender().post(msg_id, data)
    }

    pub fn quit(&self) -> Result<()> {
        self.sender().quit()
    }

    /// Park the pump once it reaches the `SUSPEND` this queues. Nested calls
    /// only count.
    pub fn suspend(&self) -> Result<()> {
        if self.suspend.count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.sender().send_reserved(ThreadMessage::new(SUSPEND), true)?;
        }
        Ok(())
    }

    /// Let a thread created suspended begin pumping. Does nothing once it
    /// has started, and never touches the suspend count.
    pub fn start(&self) -> Result<()> {
        if self.thread.resume()? {
            debug!(actor = %self.options.name, "started");
        }
        Ok(())
    }

    /// Undo one `suspend`. Unmatched calls are ignored.
    pub fn resume(&self) -> Result<()> {
        let previous = self.suspend.count.fetch_sub(1, Ordering::AcqRel);
        match previous {
            1 => self.suspend.sem.increment(),
            p if p <= 0 => {
                self.suspend.count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn suspend_count(&self) -> i32 {
        self.suspend.count.load(Ordering::Acquire)
    }

    /// Wait for the pump to stop; yields the error that stopped it, if any.
    pub fn join(&self) -> Result<()> {
        self.thread.join()
    }

    pub fn run_state(&self) -> RunState {
        self.thread.run_state()
    }

    pub fn thread_id(&self) -> i32 {
        self.options.thread_id
    }

    pub fn queue(&self) -> &ThreadQueue {
        &self.queue
    }
}

impl<A: Actor> Drop for ActorThread<A> {
    fn drop(&mut self) {
        if !self.thread.is_joinable() {
            return;
        }
        if self.thread.run_state() != RunState::DoneRunning {
            if let Err(e) = self.sender().send_reserved(ThreadMessage::new(QUIT), false) {
                warn!(actor = %self.options.name, error = %e, "could not queue quit");
            }
            let deadline = std::time::Instant::now() + QUIT_GRACE;
            while self.thread.run_state() != RunState::DoneRunning && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        // ThreadBasic's own drop forces the wake and joins.
    }
}

impl<A: Actor> std::fmt::Debug for ActorThread<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorThread")
            .field("name", &self.options.name)
            .field("thread_id", &self.options.thread_id)
            .field("state", &self.run_state())
            .field("queue", &self.queue)
            .finish()
    }
}
