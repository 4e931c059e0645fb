// Per-thread cancellation of blocking semaphore waits.
//
// A thread started through ThreadBasic installs its token here. Semaphore
// waits poll it every time the futex wait returns, and `interrupt` knocks a
// blocked thread out of the futex syscall with SIGUSR1 so the poll happens.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

#[derive(Debug, Default)]
pub struct CancelToken {
    requested: AtomicBool,
    observed: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Set once a blocked wait has seen the request and backed out.
    pub fn was_observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<CancelToken>>> = RefCell::new(None);
}

pub fn install(token: Arc<CancelToken>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(token));
}

pub fn cancel_requested() -> bool {
    CURRENT.with(|c| c.borrow().as_ref().map_or(false, |t| t.is_requested()))
}

pub(crate) fn mark_observed() {
    CURRENT.with(|c| {
        if let Some(t) = c.borrow().as_ref() {
            t.observed.store(true, Ordering::Release);
        }
    });
}

#[cfg(unix)]
extern "C" fn on_wake_signal(_sig: libc::c_int) {}

/// Install the no-op SIGUSR1 handler. Deliberately without SA_RESTART so an
/// interrupted FUTEX_WAIT returns EINTR instead of being restarted.
#[cfg(unix)]
pub fn ensure_signal_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_wake_signal as extern "C" fn(libc::c_int) as usize;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "unable to install SIGUSR1 wake handler"
            );
        }
    });
}

#[cfg(not(unix))]
pub fn ensure_signal_handler() {}

#[cfg(unix)]
pub fn interrupt(thread: libc::pthread_t) {
    ensure_signal_handler();
    unsafe {
        libc::pthread_kill(thread, libc::SIGUSR1);
    }
}
