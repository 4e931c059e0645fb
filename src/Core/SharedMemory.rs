// Shared memory backend for Linux (/dev/shm + mmap) and the reference-counted
// segment built on top of it.

use crate::error::{IpcError, Result};
use crate::Synch::mutex::{MutexGuard, RawMutex};
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

/// Shared memory backend trait for cross-platform memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;
}

pub const SEGMENT_ALIGN: usize = 128;

pub const fn align_up(size: usize) -> usize {
    (size + SEGMENT_ALIGN - 1) & !(SEGMENT_ALIGN - 1)
}

fn shm_path(name: &str) -> String {
    format!("/dev/shm/{}", name)
}

/// Create a new shared memory object. Fails with `AlreadyExists` if another
/// process got there first; the caller then attaches instead.
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to an existing shared memory object, mapping all of it.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, min_size)?))
}

/// Remove the OS-level object. Existing mappings stay valid.
#[cfg(target_os = "linux")]
pub fn remove_shared_memory(name: &str) -> io::Result<()> {
    match std::fs::remove_file(shm_path(name)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn remove_shared_memory(_name: &str) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Exclusively create `/dev/shm/<name>` and size it. The pages come back
    /// zero-filled.
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        Self::map(file.into_raw_fd(), size)
    }

    /// Open `/dev/shm/<name>` created by someone else. Returns `WouldBlock`
    /// while the creator has not sized it to `min_size` yet.
    pub fn attach(name: &str, min_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(shm_path(name))?;

        let actual_size = file.metadata()?.len() as usize;
        if actual_size < min_size {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "shared memory {} holds {} bytes, expected at least {}",
                    name, actual_size, min_size
                ),
            ));
        }

        Self::map(file.into_raw_fd(), actual_size)
    }

    fn map(fd: i32, size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // mmap hands back page-aligned memory, which covers SEGMENT_ALIGN.
        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => Ok(Self { ptr, size, fd }),
            None => {
                unsafe { libc::close(fd) };
                Err(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }
}

// ---------------------------------------------------------------------------
// Reference-counted segment
// ---------------------------------------------------------------------------

const SEGMENT_MAGIC: u64 = 0x444D_5850_5F53_474D; // "DMXP_SGM"
const ATTACH_RETRIES: usize = 10_000;

/// Header at offset 0 of every segment. `usage` and `destroyed` only change
/// with `mutex` held.
#[repr(C, align(128))]
pub struct SegmentHeader {
    pub magic: AtomicU64,
    pub mutex: RawMutex,
    pub usage: AtomicI64,
    pub destroyed: AtomicU32,
    pub data_size: AtomicU64,
}

pub const HEADER_SIZE: usize = align_up(std::mem::size_of::<SegmentHeader>());

/// Runs exactly once, in whichever process detaches last, before the OS
/// object is removed.
pub trait DestroyHook: Send + Sync {
    fn on_destroy(&self, segment: &SharedSegment);
}

/// A named region plus header. Dropping it is the detach.
pub struct SharedSegment {
    shm: Box<dyn SharedMemoryBackend>,
    name: String,
    created: bool,
    hook: Option<Box<dyn DestroyHook>>,
}

impl SharedSegment {
    /// Map or create `name` with room for `size` data bytes and register
    /// this process as a user.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let total = HEADER_SIZE + align_up(size);
        for _ in 0..ATTACH_RETRIES {
            let (shm, created) = match create_shared_memory(total, name) {
                Ok(shm) => {
                    let header = shm.as_ptr() as *mut SegmentHeader;
                    unsafe {
                        // The header mutex is built in place before anyone else
                        // can pass the magic check below.
                        ptr::write(
                            header,
                            SegmentHeader {
                                magic: AtomicU64::new(0),
                                mutex: RawMutex::new(true, true),
                                usage: AtomicI64::new(0),
                                destroyed: AtomicU32::new(0),
                                data_size: AtomicU64::new(size as u64),
                            },
                        );
                        (*header).magic.store(SEGMENT_MAGIC, Ordering::Release);
                    }
                    (shm, true)
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match attach_shared_memory(name, HEADER_SIZE) {
                        Ok(shm) => (shm, false),
                        Err(e)
                            if e.kind() == io::ErrorKind::NotFound
                                || e.kind() == io::ErrorKind::WouldBlock =>
                        {
                            std::thread::yield_now();
                            continue;
                        }
                        Err(source) => {
                            return Err(IpcError::SegmentMap {
                                name: name.to_string(),
                                source,
                            })
                        }
                    }
                }
                Err(source) => {
                    return Err(IpcError::SegmentCreate {
                        name: name.to_string(),
                        source,
                    })
                }
            };

            let header = unsafe { &*(shm.as_ptr() as *const SegmentHeader) };
            if !created && !wait_ready(header) {
                continue;
            }
            if shm.size() < total {
                return Err(IpcError::SegmentTooSmall {
                    name: name.to_string(),
                    expected: total,
                    actual: shm.size(),
                });
            }

            let _guard = header.mutex.lock()?;
            if header.destroyed.load(Ordering::Acquire) != 0 {
                // Lost the race with the final detach; that object is being
                // unlinked, so start over against a fresh one.
                drop(_guard);
                std::thread::yield_now();
                continue;
            }
            let usage = header.usage.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(segment = name, usage, created, "attached shared segment");
            drop(_guard);

            return Ok(Self {
                shm,
                name: name.to_string(),
                created,
                hook: None,
            });
        }

        Err(IpcError::SegmentMap {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "segment never became ready"),
        })
    }

    pub fn set_destroy_hook(&mut self, hook: Box<dyn DestroyHook>) {
        self.hook = Some(hook);
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.shm.as_ptr() as *const SegmentHeader) }
    }

    /// Start of the data area, 128-byte aligned.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(HEADER_SIZE) }
    }

    pub fn data_size(&self) -> usize {
        self.header().data_size.load(Ordering::Relaxed) as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when this process created the OS object.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn usage_count(&self) -> i64 {
        self.header().usage.load(Ordering::Acquire)
    }

    /// Take the header mutex, which serializes attach and detach.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.header().mutex.lock()
    }

    pub fn backend(&self) -> &dyn SharedMemoryBackend {
        &*self.shm
    }
}

fn wait_ready(header: &SegmentHeader) -> bool {
    for _ in 0..ATTACH_RETRIES {
        if header.magic.load(Ordering::Acquire) == SEGMENT_MAGIC {
            return true;
        }
        std::thread::yield_now();
    }
    false
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        let header = self.header();
        let guard = match header.mutex.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(segment = %self.name, error = %e, "detach could not lock segment header");
                return;
            }
        };
        let usage = header.usage.fetch_sub(1, Ordering::AcqRel) - 1;
        if usage <= 0 {
            header.destroyed.store(1, Ordering::Release);
            if let Some(hook) = self.hook.as_ref() {
                hook.on_destroy(self);
            }
            if let Err(e) = remove_shared_memory(&self.name) {
                tracing::warn!(segment = %self.name, error = %e, "failed to remove shared segment");
            }
            info!(segment = %self.name, "destroyed shared segment");
        } else {
            debug!(segment = %self.name, usage, "detached shared segment");
        }
        drop(guard);
    }
}

impl Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_shared_segment(self, f)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("dmxp_ut_{}_{}", tag, std::process::id())
    }

    #[test]
    fn exclusive_create_then_attach() {
        let name = unique("excl");
        let a = create_shared_memory(4096, &name).unwrap();
        let err = create_shared_memory(4096, &name).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        let b = attach_shared_memory(&name, 4096).unwrap();
        unsafe {
            *a.as_ptr() = 0x5A;
            assert_eq!(*b.as_ptr(), 0x5A);
        }
        remove_shared_memory(&name).unwrap();
    }

    #[test]
    fn attach_missing_is_not_found() {
        let err = attach_shared_memory(&unique("missing"), 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn header_size_keeps_data_aligned() {
        assert_eq!(HEADER_SIZE % SEGMENT_ALIGN, 0);
        assert!(HEADER_SIZE >= std::mem::size_of::<SegmentHeader>());
    }
}
