//! Managed closures exposed to the runtime as packed C functions.
//!
//! The resource pointer handed to the runtime is a boxed [`CallbackState`].
//! The runtime calls [`trampoline`] for every invocation and [`finalize`]
//! once, when the last reference to the function handle is released.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};

use tvmrt::abi::{TvmByteArray, TvmValue, TypeCode};

use crate::base::check_call;
use crate::error::{BridgeError, BridgeResult};
use crate::lib_info::LibInfo;
use crate::value::Value;

/// A managed function the runtime can call. Runs synchronously on whichever
/// thread invoked the native handle.
pub trait Callback: Send + Sync {
    fn invoke(&self, args: &[Value]) -> BridgeResult<Value>;
}

impl<F> Callback for F
where
    F: Fn(&[Value]) -> BridgeResult<Value> + Send + Sync,
{
    fn invoke(&self, args: &[Value]) -> BridgeResult<Value> {
        self(args)
    }
}

struct CallbackState {
    lib: LibInfo,
    callback: Box<dyn Callback>,
}

thread_local! {
    static RET_STR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static RET_BYTES: RefCell<Option<(Vec<u8>, Box<TvmByteArray>)>> = const { RefCell::new(None) };
}

pub(crate) fn into_resource<C>(lib: LibInfo, callback: C) -> *mut c_void
where
    C: Callback + 'static,
{
    let state = Box::new(CallbackState {
        lib,
        callback: Box::new(callback),
    });
    Box::into_raw(state) as *mut c_void
}

pub(crate) unsafe extern "C" fn trampoline(
    args: *const TvmValue,
    type_codes: *const c_int,
    num_args: c_int,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
    resource: *mut c_void,
) -> c_int {
    if resource.is_null() {
        return tvmrt::TVM_ERR_NATIVE;
    }
    let state = &*(resource as *const CallbackState);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let args = decode_args(&state.lib, args, type_codes, num_args)?;
        let value = state.callback.invoke(&args)?;
        write_return(&state.lib, value, ret_val, ret_type_code)
    }));
    let result = match outcome {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::Callback(format!(
            "callback panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };
    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::debug!(status = err.status(), "callback failed: {}", err);
            state.lib.set_last_error(err.message());
            err.status()
        }
    }
}

pub(crate) unsafe extern "C" fn finalize(resource: *mut c_void) {
    if resource.is_null() {
        return;
    }
    let state = Box::from_raw(resource as *mut CallbackState);
    if panic::catch_unwind(AssertUnwindSafe(move || drop(state))).is_err() {
        tracing::error!("callback state panicked while being dropped");
    }
}

unsafe fn decode_args(
    lib: &LibInfo,
    args: *const TvmValue,
    type_codes: *const c_int,
    num_args: c_int,
) -> BridgeResult<Vec<Value>> {
    let n = usize::try_from(num_args).unwrap_or(0);
    if n == 0 {
        return Ok(Vec::new());
    }
    if args.is_null() || type_codes.is_null() {
        return Err(BridgeError::InvalidArgument(
            "null argument arrays passed to callback".into(),
        ));
    }
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(Value::from_raw(lib, *args.add(i), *type_codes.add(i), false)?);
    }
    Ok(out)
}

/// Moves `value` into the runtime's return slot. Handles leave with an owned
/// reference; strings and bytes stay alive in thread-local storage until the
/// next callback returns on this thread.
unsafe fn write_return(
    lib: &LibInfo,
    value: Value,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
) -> BridgeResult<()> {
    if ret_val.is_null() || ret_type_code.is_null() {
        return Err(BridgeError::InvalidArgument(
            "null return slot passed to callback".into(),
        ));
    }
    let code = value.type_code();
    let raw = match value {
        Value::Null => TvmValue::null(),
        Value::Int(v) => TvmValue { v_int64: v },
        Value::Float(v) => TvmValue { v_float64: v },
        Value::Str(s) => {
            let c = CString::new(s).map_err(|_| {
                BridgeError::InvalidArgument("callback result contains a nul byte".into())
            })?;
            RET_STR.with(|slot| {
                let ptr = c.as_ptr();
                *slot.borrow_mut() = Some(c);
                TvmValue { v_str: ptr }
            })
        }
        Value::Bytes(b) => RET_BYTES.with(|slot| {
            let array = Box::new(TvmByteArray {
                data: b.as_ptr(),
                size: b.len(),
            });
            let ptr = &*array as *const TvmByteArray as *mut c_void;
            *slot.borrow_mut() = Some((b, array));
            TvmValue { v_handle: ptr }
        }),
        Value::Handle { handle, type_code } => {
            if type_code.is_tracked_handle() {
                check_call(lib, lib.object_retain(handle))?;
            }
            TvmValue { v_int64: handle }
        }
        Value::Function(f) => TvmValue {
            v_int64: f.into_raw(),
        },
        Value::NDArray(a) => TvmValue {
            v_int64: a.into_raw(),
        },
    };
    *ret_val = raw;
    *ret_type_code = code as c_int;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
