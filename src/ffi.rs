use crate::config::RuntimeConfig;
use crate::error::{IpcError, Severity};
use crate::Queue::{MessageQueue, QueueMode};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use tracing::error;

// Error codes
pub const DMXP_SUCCESS: i32 = 0;
pub const DMXP_ERROR_NULL_POINTER: i32 = -1;
pub const DMXP_ERROR_INVALID_ARG: i32 = -2;
pub const DMXP_ERROR_EXHAUSTED: i32 = -3;
pub const DMXP_ERROR_QUEUE_FULL: i32 = -4;
pub const DMXP_ERROR_EMPTY: i32 = -5;
pub const DMXP_ERROR_INTERNAL: i32 = -6;
pub const DMXP_ERROR_CONTRACT: i32 = -7;
pub const DMXP_ERROR_BUFFER_TOO_SMALL: i32 = -8;
pub const DMXP_ERROR_CANCELLED: i32 = -9;

pub const DMXP_MODE_READ: i32 = 0;
pub const DMXP_MODE_WRITE: i32 = 1;
pub const DMXP_MODE_READ_WRITE: i32 = 2;

/// Handle to an open public queue (opaque pointer)
pub struct QueueHandle {
    queue: MessageQueue<Vec<u8>>,
    /// A record popped into a buffer that was too small, handed out next.
    pending: Mutex<Option<Vec<u8>>>,
}

fn error_code(e: &IpcError) -> i32 {
    match e.severity() {
        Severity::Exhaustion => DMXP_ERROR_EXHAUSTED,
        Severity::ContractViolation => DMXP_ERROR_CONTRACT,
        Severity::Cancelled => DMXP_ERROR_CANCELLED,
        Severity::Os | Severity::Application => DMXP_ERROR_INTERNAL,
    }
}

/// Install the runtime configuration from a JSON document.
///
/// # Returns
/// * 0 on success, negative error code otherwise.
///
/// # Safety
/// `json` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn dmxp_init(json: *const c_char) -> i32 {
    if json.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let text = match CStr::from_ptr(json).to_str() {
        Ok(text) => text,
        Err(_) => return DMXP_ERROR_INVALID_ARG,
    };
    let result = RuntimeConfig::from_json_str(text).and_then(crate::init);
    match result {
        Ok(()) => DMXP_SUCCESS,
        Err(e @ IpcError::ConfigParse(_)) => {
            error!(error = %e, "dmxp_init: bad configuration");
            DMXP_ERROR_INVALID_ARG
        }
        Err(e) => {
            error!(error = %e, "dmxp_init failed");
            error_code(&e)
        }
    }
}

/// Open a configured public queue.
///
/// # Arguments
/// * `queue_id` - Id of a queue listed in the configuration.
/// * `mode` - One of `DMXP_MODE_READ`, `DMXP_MODE_WRITE`, `DMXP_MODE_READ_WRITE`.
///
/// # Returns
/// * Pointer to `QueueHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn dmxp_queue_open(queue_id: i32, mode: i32) -> *mut QueueHandle {
    let mode = match mode {
        DMXP_MODE_READ => QueueMode::ReadOnly,
        DMXP_MODE_WRITE => QueueMode::WriteOnly,
        DMXP_MODE_READ_WRITE => QueueMode::ReadWrite,
        _ => return ptr::null_mut(),
    };
    match MessageQueue::open_public(queue_id, mode) {
        Ok(queue) => Box::into_raw(Box::new(QueueHandle {
            queue,
            pending: Mutex::new(None),
        })),
        Err(e) => {
            error!(queue_id, error = %e, "dmxp_queue_open failed");
            ptr::null_mut()
        }
    }
}

/// Push one record.
///
/// # Returns
/// * 0 on success.
/// * DMXP_ERROR_QUEUE_FULL if `wait` is false and there is no room.
///
/// # Safety
/// `handle` must come from `dmxp_queue_open`; `data` must be valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn dmxp_queue_push(
    handle: *mut QueueHandle,
    data: *const u8,
    len: usize,
    wait: bool,
) -> i32 {
    if handle.is_null() || (data.is_null() && len > 0) {
        return DMXP_ERROR_NULL_POINTER;
    }
    let handle = &*handle;
    let record = if len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, len).to_vec()
    };
    match handle.queue.push(&record, wait) {
        Ok(true) => DMXP_SUCCESS,
        Ok(false) => DMXP_ERROR_QUEUE_FULL,
        Err(e) => {
            error!(queue_id = handle.queue.queue_id(), error = %e, "dmxp_queue_push failed");
            error_code(&e)
        }
    }
}

/// Pop one record.
///
/// # Arguments
/// * `out_buf` - Buffer to write the record into.
/// * `out_len` - Input: size of buf, Output: size of the record.
///
/// # Returns
/// * 0 on success.
/// * DMXP_ERROR_EMPTY if `wait` is false and the queue is empty.
/// * DMXP_ERROR_BUFFER_TOO_SMALL with `*out_len` set to the size needed; the
///   record is kept and returned by the next call.
///
/// # Safety
/// `handle` must come from `dmxp_queue_open`; `out_buf` must be valid for
/// `*out_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn dmxp_queue_pop(
    handle: *mut QueueHandle,
    wait: bool,
    out_buf: *mut u8,
    out_len: *mut usize,
) -> i32 {
    if handle.is_null() || out_len.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let handle = &*handle;
    let max_len = *out_len;

    let mut pending = handle.pending.lock();
    let record = match pending.take() {
        Some(record) => record,
        None => match handle.queue.pop(wait) {
            Ok(Some(record)) => record,
            Ok(None) => return DMXP_ERROR_EMPTY,
            Err(e) => {
                error!(queue_id = handle.queue.queue_id(), error = %e, "dmxp_queue_pop failed");
                return error_code(&e);
            }
        },
    };

    *out_len = record.len();
    if record.len() > max_len || (out_buf.is_null() && !record.is_empty()) {
        *pending = Some(record);
        return DMXP_ERROR_BUFFER_TOO_SMALL;
    }
    if !record.is_empty() {
        ptr::copy_nonoverlapping(record.as_ptr(), out_buf, record.len());
    }
    DMXP_SUCCESS
}

/// Close a queue handle.
///
/// # Safety
/// `handle` must come from `dmxp_queue_open` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn dmxp_queue_close(handle: *mut QueueHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}
