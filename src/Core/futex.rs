use std::sync::atomic::AtomicU32;

/// Why a futex wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken, or the word no longer held `expected`.
    Woken,
    /// A signal interrupted the wait (see `Synch::cancel`).
    Interrupted,
}

#[cfg(target_os = "linux")]
fn op(base: libc::c_int, shared: bool) -> libc::c_int {
    // Words living in a MAP_SHARED mapping must use the non-private form,
    // otherwise waiters in other processes are never found.
    if shared {
        base
    } else {
        base | libc::FUTEX_PRIVATE_FLAG
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wait(atomic: &AtomicU32, expected: u32, shared: bool) -> WaitOutcome {
    use std::ptr;
    use std::sync::atomic::Ordering;

    // Check condition first to avoid syscall if possible
    if atomic.load(Ordering::Relaxed) != expected {
        return WaitOutcome::Woken;
    }

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            op(libc::FUTEX_WAIT, shared),
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
        WaitOutcome::Interrupted
    } else {
        WaitOutcome::Woken
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(atomic: &AtomicU32, waiters: i32, shared: bool) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            atomic as *const AtomicU32 as *const u32,
            op(libc::FUTEX_WAKE, shared),
            waiters,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_atomic: &AtomicU32, _expected: u32, _shared: bool) -> WaitOutcome {
    // Fallback for non-Linux: busy wait with yield
    std::thread::yield_now();
    WaitOutcome::Woken
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_atomic: &AtomicU32, _waiters: i32, _shared: bool) {
    // No-op on non-Linux
}

/// Identity of the calling thread that is unique across every process on the
/// host: pid in the high half, kernel tid in the low half. Never zero.
pub fn thread_token() -> u64 {
    thread_local! {
        static TOKEN: u64 = compute_token();
    }
    TOKEN.with(|t| *t)
}

#[cfg(target_os = "linux")]
fn compute_token() -> u64 {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
    ((std::process::id() as u64) << 32) | (tid & 0xFFFF_FFFF)
}

#[cfg(not(target_os = "linux"))]
fn compute_token() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ((std::process::id() as u64) << 32) | NEXT.fetch_add(1, Ordering::Relaxed)
}
