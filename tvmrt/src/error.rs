use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};

use libc::{c_char, c_int};
use thiserror::Error;

pub const TVM_OK: c_int = 0;
pub const TVM_ERR_NATIVE: c_int = -1;
pub const TVM_ERR_NOT_FOUND: c_int = -2;
pub const TVM_ERR_ALREADY_EXISTS: c_int = -3;
pub const TVM_ERR_INVALID_ARGUMENT: c_int = -4;

const NO_ERROR: &CStr = c"no error recorded";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Native(String),
}

impl RuntimeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument(message.into())
    }

    pub fn native(message: impl Into<String>) -> Self {
        RuntimeError::Native(message.into())
    }

    pub fn status(&self) -> c_int {
        match self {
            RuntimeError::NotFound(_) => TVM_ERR_NOT_FOUND,
            RuntimeError::AlreadyExists(_) => TVM_ERR_ALREADY_EXISTS,
            RuntimeError::InvalidArgument(_) => TVM_ERR_INVALID_ARGUMENT,
            RuntimeError::Native(_) => TVM_ERR_NATIVE,
        }
    }

    /// Rebuilds an error from a status reported by foreign code.
    pub fn from_status(status: c_int, message: String) -> Self {
        match status {
            TVM_ERR_NOT_FOUND => RuntimeError::NotFound(message),
            TVM_ERR_ALREADY_EXISTS => RuntimeError::AlreadyExists(message),
            TVM_ERR_INVALID_ARGUMENT => RuntimeError::InvalidArgument(message),
            _ => RuntimeError::Native(message),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

pub(crate) fn set_error(message: impl Into<String>) {
    let mut msg = message.into();
    if msg.is_empty() {
        msg = "unknown error".to_string();
    }
    let cstr = CString::new(msg.replace('\0', " "))
        .unwrap_or_else(|_| CString::from(c"unknown error"));
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(cstr);
    });
}

/// Empties the slot, returning what was there.
pub(crate) fn take_error() -> Option<CString> {
    LAST_ERROR.with(|cell| cell.borrow_mut().take())
}

pub(crate) fn restore_error(saved: Option<CString>) {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = saved;
    });
}

/// Pointer to the current thread's message, or to a static placeholder when
/// nothing has failed yet. Valid until the next failure on this thread.
pub(crate) fn last_error_ptr() -> *const c_char {
    LAST_ERROR.with(|cell| match &*cell.borrow() {
        Some(msg) => msg.as_ptr(),
        None => placeholder().as_ptr(),
    })
}

pub(crate) fn last_error_message() -> Option<String> {
    LAST_ERROR.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|msg| msg.to_string_lossy().into_owned())
    })
}

pub(crate) fn placeholder() -> &'static CStr {
    NO_ERROR
}

/// Records the error (if any) and converts the outcome into a status code.
pub(crate) fn status_of(result: RuntimeResult<()>) -> c_int {
    match result {
        Ok(()) => TVM_OK,
        Err(err) => {
            tracing::debug!(status = err.status(), "{}", err);
            let status = err.status();
            set_error(err.to_string());
            status
        }
    }
}

pub(crate) fn ffi_guard<T, F>(default: T, f: F) -> T
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "panic across FFI boundary"
            };
            set_error(format!("panic: {}", msg));
            default
        }
    }
}
