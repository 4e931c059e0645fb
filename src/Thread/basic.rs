use crate::error::{IpcError, Result};
use crate::Synch::cancel::{self, CancelToken};
use crate::Synch::{SemaphoreOps, SemaphorePrivate};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const CANCEL_ATTEMPTS: usize = 500;
const CANCEL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    WaitingToRun = 0,
    Running = 1,
    DoneRunning = 2,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::WaitingToRun,
            1 => RunState::Running,
            _ => RunState::DoneRunning,
        }
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ThreadShared {
    id: u64,
    name: String,
    state: AtomicU8,
    gate: SemaphorePrivate,
    gate_open: AtomicBool,
    cancel: Arc<CancelToken>,
    pthread: AtomicU64,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadShared>>> = RefCell::new(None);
}

/// What a running thread can learn about itself.
#[derive(Clone)]
pub struct ThreadRef {
    shared: Arc<ThreadShared>,
}

impl ThreadRef {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel.is_requested()
    }
}

impl std::fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRef")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.run_state())
            .finish()
    }
}

/// An OS thread with a start gate, a run state and cooperative
/// cancellation of its blocking waits. Carries no queue.
pub struct ThreadBasic {
    shared: Arc<ThreadShared>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
    initialized: AtomicBool,
}

impl ThreadBasic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(ThreadShared {
                id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                state: AtomicU8::new(RunState::WaitingToRun as u8),
                gate: SemaphorePrivate::new(0, 1),
                gate_open: AtomicBool::new(false),
                cancel: CancelToken::new(),
                pthread: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Spawn the OS thread. With `suspended` it parks before running `body`
    /// until `resume`. A `stack_size` of 0 keeps the platform default.
    pub fn init<F>(&self, suspended: bool, stack_size: usize, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(IpcError::AlreadyInitialized { what: "thread" });
        }
        cancel::ensure_signal_handler();

        let shared = Arc::clone(&self.shared);
        let mut builder = std::thread::Builder::new().name(self.shared.name.clone());
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder
            .spawn(move || {
                cancel::install(Arc::clone(&shared.cancel));
                CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&shared)));
                #[cfg(unix)]
                shared
                    .pthread
                    .store(unsafe { libc::pthread_self() } as u64, Ordering::Release);

                let result = match shared.gate.decrement(true) {
                    Ok(_) => {
                        shared.state.store(RunState::Running as u8, Ordering::Release);
                        debug!(thread = %shared.name, "thread running");
                        body()
                    }
                    Err(e) => Err(e),
                };
                shared.state.store(RunState::DoneRunning as u8, Ordering::Release);
                debug!(thread = %shared.name, ok = result.is_ok(), "thread done");
                result
            })
            .map_err(|e| {
                self.initialized.store(false, Ordering::Release);
                IpcError::os(format!("spawn thread [{}]", self.shared.name), e)
            })?;
        *self.handle.lock() = Some(handle);

        if !suspended {
            self.resume()?;
        }
        Ok(())
    }

    /// Open the start gate of a thread created suspended. Returns whether
    /// this call opened it.
    pub fn resume(&self) -> Result<bool> {
        if self.shared.gate_open.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.shared.gate.increment()?;
        Ok(true)
    }

    /// Wait for the thread to finish and hand back what its body returned.
    pub fn join(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .take()
            .ok_or(IpcError::NotInitialized { what: "thread" })?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(IpcError::ThreadPanicked(self.shared.name.clone())),
        }
    }

    pub fn is_joinable(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Ask the thread to abandon whatever blocking wait it is in, and keep
    /// knocking it out of the futex until it notices or finishes. Returns
    /// false if it did neither in time.
    pub fn cancel_wait(&self) -> bool {
        self.shared.cancel.request();
        for _ in 0..CANCEL_ATTEMPTS {
            if self.run_state() == RunState::DoneRunning || self.shared.cancel.was_observed() {
                return true;
            }
            #[cfg(unix)]
            {
                let pthread = self.shared.pthread.load(Ordering::Acquire);
                // The handle is not joined yet, so the pthread id is still valid.
                if pthread != 0 && self.is_joinable() {
                    cancel::interrupt(pthread as libc::pthread_t);
                }
            }
            std::thread::sleep(CANCEL_INTERVAL);
        }
        warn!(thread = %self.shared.name, "thread did not observe cancellation");
        false
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True while the thread runs and nobody has asked it to stop.
    pub fn keep_going(&self) -> bool {
        self.run_state() == RunState::Running && !self.shared.cancel.is_requested()
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn sleep(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    pub fn yield_now() {
        std::thread::yield_now();
    }

    /// The `ThreadBasic` running the calling thread, if any.
    pub fn current() -> Option<ThreadRef> {
        CURRENT.with(|c| c.borrow().as_ref().map(|shared| ThreadRef {
            shared: Arc::clone(shared),
        }))
    }
}

impl Drop for ThreadBasic {
    fn drop(&mut self) {
        if !self.is_joinable() {
            return;
        }
        if self.run_state() != RunState::DoneRunning {
            self.cancel_wait();
        }
        if let Err(e) = self.join() {
            if !e.is_cancelled() {
                warn!(thread = %self.shared.name, error = %e, "thread ended with error");
            }
        }
    }
}

impl std::fmt::Debug for ThreadBasic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBasic")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.run_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn suspended_thread_waits_for_resume() {
        let ran = Arc::new(AtomicUsize::new(0));
        let thread = ThreadBasic::new("gated");
        let seen = Arc::clone(&ran);
        thread
            .init(true, 0, move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(thread.run_state(), RunState::WaitingToRun);
        assert!(thread.resume().unwrap());
        assert!(!thread.resume().unwrap());
        thread.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(thread.run_state(), RunState::DoneRunning);
    }

    #[test]
    fn second_init_is_rejected() {
        let thread = ThreadBasic::new("once");
        thread.init(false, 64 * 1024, || Ok(())).unwrap();
        assert!(matches!(
            thread.init(false, 0, || Ok(())),
            Err(IpcError::AlreadyInitialized { .. })
        ));
        thread.join().unwrap();
    }

    #[test]
    fn current_is_set_inside_the_thread() {
        let thread = ThreadBasic::new("whoami");
        let id = thread.id();
        thread
            .init(false, 0, move || {
                let me = ThreadBasic::current().ok_or(IpcError::NotInitialized { what: "current" })?;
                assert_eq!(me.id(), id);
                assert_eq!(me.name(), "whoami");
                Ok(())
            })
            .unwrap();
        thread.join().unwrap();
        assert!(ThreadBasic::current().is_none());
    }

    #[test]
    fn panicking_body_is_reported() {
        let thread = ThreadBasic::new("boom");
        thread.init(false, 0, || panic!("handler blew up")).unwrap();
        assert!(matches!(thread.join(), Err(IpcError::ThreadPanicked(_))));
    }
}
