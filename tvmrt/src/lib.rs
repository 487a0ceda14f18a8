//! Native tensor runtime exposed through a C ABI.
//!
//! Every export returns a status code (`0` on success) and reports results
//! through out-parameters. When a call fails, `tvm_get_last_error` returns the
//! message for the calling thread.

use std::ffi::CStr;

use libc::{c_char, c_int, c_void};

pub mod abi;
mod args;
mod device;
mod error;
mod handles;
mod registry;
mod tensor;

use abi::{
    DLDataType, DLDevice, TvmHandle, TvmPackedCFunc, TvmPackedCFuncFinalizer,
    TvmValue, TypeCode,
};
use args::ArgValue;
use error::{ffi_guard, set_error, status_of};
use handles::HandleKind;

pub use error::{
    RuntimeError, RuntimeResult, TVM_ERR_ALREADY_EXISTS, TVM_ERR_INVALID_ARGUMENT,
    TVM_ERR_NATIVE, TVM_ERR_NOT_FOUND, TVM_OK,
};

fn cstr_to_string(ptr: *const c_char) -> RuntimeResult<String> {
    if ptr.is_null() {
        return Err(RuntimeError::invalid("null string pointer"));
    }
    let cstr = unsafe { CStr::from_ptr(ptr) };
    cstr.to_str()
        .map(|s| s.to_string())
        .map_err(|_| RuntimeError::invalid("string is not valid UTF-8"))
}

unsafe fn write_out<T>(out: *mut T, value: T) -> RuntimeResult<()> {
    if out.is_null() {
        return Err(RuntimeError::invalid("null out-parameter"));
    }
    out.write(value);
    Ok(())
}

/// Hands a heap buffer to the caller; it must come back through `tvm_free`.
unsafe fn write_buffer(
    bytes: Vec<u8>,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> RuntimeResult<()> {
    if out_ptr.is_null() || out_len.is_null() {
        return Err(RuntimeError::invalid("null out-parameter"));
    }
    let mut bytes = bytes.into_boxed_slice().into_vec();
    let len = bytes.len();
    let data = bytes.as_mut_ptr();
    std::mem::forget(bytes);
    *out_ptr = data;
    *out_len = len;
    Ok(())
}

#[no_mangle]
pub extern "C" fn tvm_get_last_error() -> *const c_char {
    ffi_guard(error::placeholder().as_ptr(), error::last_error_ptr)
}

#[no_mangle]
/// Records `msg` as the calling thread's last error. Intended for packed C
/// functions that are about to return a nonzero status.
///
/// # Safety
/// `msg` must be null or a valid nul-terminated string.
pub unsafe extern "C" fn tvm_api_set_last_error(msg: *const c_char) {
    ffi_guard((), || {
        if msg.is_null() {
            set_error("unknown error");
        } else {
            set_error(CStr::from_ptr(msg).to_string_lossy().into_owned());
        }
    })
}

#[no_mangle]
/// # Safety
/// `ptr` and `len` must come from a single buffer returned by this library,
/// and the buffer must not be freed twice.
pub unsafe extern "C" fn tvm_free(ptr: *mut u8, len: usize) {
    ffi_guard((), || {
        if ptr.is_null() {
            return;
        }
        drop(Vec::from_raw_parts(ptr, len, len));
    })
}

#[no_mangle]
pub extern "C" fn tvm_func_push_arg_long(value: i64) {
    ffi_guard((), || args::push(ArgValue::Int(value)))
}

#[no_mangle]
pub extern "C" fn tvm_func_push_arg_double(value: f64) {
    ffi_guard((), || args::push(ArgValue::Float(value)))
}

#[no_mangle]
/// # Safety
/// `value` must be null or a valid nul-terminated string.
pub unsafe extern "C" fn tvm_func_push_arg_string(value: *const c_char) {
    ffi_guard((), || match cstr_to_string(value) {
        Ok(s) => args::push(ArgValue::Str(s)),
        Err(err) => args::poison(format!("string argument: {}", err)),
    })
}

#[no_mangle]
/// # Safety
/// `data` must be valid for `len` bytes of reads (it may be null when `len` is 0).
pub unsafe extern "C" fn tvm_func_push_arg_bytes(data: *const u8, len: usize) {
    ffi_guard((), || {
        if len == 0 {
            args::push(ArgValue::Bytes(Vec::new()));
        } else if data.is_null() {
            args::poison("bytes argument: null data pointer");
        } else {
            args::push(ArgValue::Bytes(
                std::slice::from_raw_parts(data, len).to_vec(),
            ));
        }
    })
}

#[no_mangle]
pub extern "C" fn tvm_func_push_arg_handle(handle: TvmHandle, type_code: c_int) {
    ffi_guard((), || match TypeCode::from_raw(type_code) {
        Some(code) if code.is_handle() => args::push(ArgValue::Handle {
            handle,
            type_code: code,
        }),
        _ => args::poison(format!(
            "handle argument: type code {} is not a handle type",
            type_code
        )),
    })
}

#[no_mangle]
/// Writes the registered names as a JSON array of strings.
///
/// # Safety
/// `out_json` and `out_len` must be valid writable pointers for this call.
pub unsafe extern "C" fn tvm_func_list_global_names(
    out_json: *mut *mut u8,
    out_len: *mut usize,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            let names = registry::list_names()?;
            let json = serde_json::to_vec(&names)
                .map_err(|err| RuntimeError::native(err.to_string()))?;
            write_buffer(json, out_json, out_len)
        })())
    })
}

#[no_mangle]
/// # Safety
/// `name` must be a valid nul-terminated string and `out` a writable pointer.
pub unsafe extern "C" fn tvm_func_get_global(name: *const c_char, out: *mut TvmHandle) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            if out.is_null() {
                return Err(RuntimeError::invalid("null out-parameter"));
            }
            let name = cstr_to_string(name)?;
            let handle = registry::get(&name)?;
            write_out(out, handle)
        })())
    })
}

#[no_mangle]
/// # Safety
/// `name` must be a valid nul-terminated string.
pub unsafe extern "C" fn tvm_func_register_global(
    name: *const c_char,
    handle: TvmHandle,
    override_existing: c_int,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            let name = cstr_to_string(name)?;
            registry::register(&name, handle, override_existing != 0)
        })())
    })
}

#[no_mangle]
pub extern "C" fn tvm_func_free(handle: TvmHandle) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of(handles::release(handle, Some(HandleKind::Function)))
    })
}

#[no_mangle]
/// Adds a reference to any live handle.
pub extern "C" fn tvm_object_retain(handle: TvmHandle) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || status_of(handles::retain(handle)))
}

#[no_mangle]
/// Calls `handle` with everything pushed on this thread since the last call.
/// The argument stack is emptied whatever the outcome.
///
/// # Safety
/// `ret_val` and `ret_type_code` must be valid writable pointers for this call.
pub unsafe extern "C" fn tvm_func_call(
    handle: TvmHandle,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        let pushed = args::take();
        status_of((|| {
            let call_args = pushed?;
            if ret_val.is_null() || ret_type_code.is_null() {
                return Err(RuntimeError::invalid("null out-parameter"));
            }
            let value = registry::call(handle, &call_args)?;
            let owned = match &value {
                ArgValue::Handle { handle, type_code } if type_code.is_tracked_handle() => {
                    Some(*handle)
                }
                _ => None,
            };
            let written = args::write_return(value, ret_val, ret_type_code);
            if written.is_err() {
                if let Some(owned) = owned {
                    let _ = handles::release(owned, None);
                }
            }
            written
        })())
    })
}

#[no_mangle]
/// Wraps a foreign function as a function handle. `finalizer`, if given, is
/// called with `resource` once the last reference is released.
///
/// # Safety
/// `func` and `finalizer` must be callable from any thread with `resource`,
/// and `out` must be a writable pointer.
pub unsafe extern "C" fn tvm_func_create_from_cfunc(
    func: Option<TvmPackedCFunc>,
    resource: *mut c_void,
    finalizer: Option<TvmPackedCFuncFinalizer>,
    out: *mut TvmHandle,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            if out.is_null() {
                return Err(RuntimeError::invalid("null out-parameter"));
            }
            let func = func.ok_or_else(|| RuntimeError::invalid("null function pointer"))?;
            let handle = registry::create_from_cfunc(func, resource, finalizer)?;
            write_out(out, handle)
        })())
    })
}

#[no_mangle]
/// # Safety
/// `shape` must be valid for `ndim` reads (it may be null when `ndim` is 0),
/// and `out` must be a writable pointer.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tvm_array_alloc(
    shape: *const i64,
    ndim: c_int,
    dtype_code: c_int,
    dtype_bits: c_int,
    dtype_lanes: c_int,
    device_type: c_int,
    device_id: c_int,
    out: *mut TvmHandle,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            if out.is_null() {
                return Err(RuntimeError::invalid("null out-parameter"));
            }
            let ndim = usize::try_from(ndim)
                .map_err(|_| RuntimeError::invalid(format!("negative ndim {}", ndim)))?;
            let dims: &[i64] = if ndim == 0 {
                &[]
            } else if shape.is_null() {
                return Err(RuntimeError::invalid("null shape pointer"));
            } else {
                std::slice::from_raw_parts(shape, ndim)
            };
            let dtype = DLDataType {
                code: u8::try_from(dtype_code)
                    .map_err(|_| RuntimeError::invalid("dtype code out of range"))?,
                bits: u8::try_from(dtype_bits)
                    .map_err(|_| RuntimeError::invalid("dtype bits out of range"))?,
                lanes: u16::try_from(dtype_lanes)
                    .map_err(|_| RuntimeError::invalid("dtype lanes out of range"))?,
            };
            let device = DLDevice {
                device_type,
                device_id,
            };
            let handle = tensor::alloc(dims, dtype, device)?;
            write_out(out, handle)
        })())
    })
}

#[no_mangle]
/// Writes the tensor's dimensions as a JSON array of integers.
///
/// # Safety
/// `out_json` and `out_len` must be valid writable pointers for this call.
pub unsafe extern "C" fn tvm_array_get_shape(
    handle: TvmHandle,
    out_json: *mut *mut u8,
    out_len: *mut usize,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            let shape = tensor::shape(handle)?;
            let json = serde_json::to_vec(&shape)
                .map_err(|err| RuntimeError::native(err.to_string()))?;
            write_buffer(json, out_json, out_len)
        })())
    })
}

#[no_mangle]
/// # Safety
/// `out_dtype` and `out_device` must be valid writable pointers for this call.
pub unsafe extern "C" fn tvm_array_get_meta(
    handle: TvmHandle,
    out_dtype: *mut DLDataType,
    out_device: *mut DLDevice,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            if out_dtype.is_null() || out_device.is_null() {
                return Err(RuntimeError::invalid("null out-parameter"));
            }
            let (dtype, device) = tensor::meta(handle)?;
            write_out(out_dtype, dtype)?;
            write_out(out_device, device)
        })())
    })
}

#[no_mangle]
pub extern "C" fn tvm_array_copy_from_to(src: TvmHandle, dst: TvmHandle) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || status_of(tensor::copy_from_to(src, dst)))
}

#[no_mangle]
/// # Safety
/// `data` must be valid for `len` bytes of reads (it may be null when `len` is 0).
pub unsafe extern "C" fn tvm_array_copy_from_bytes(
    data: *const u8,
    len: usize,
    dst: TvmHandle,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            let bytes: &[u8] = if len == 0 {
                &[]
            } else if data.is_null() {
                return Err(RuntimeError::invalid("null data pointer"));
            } else {
                std::slice::from_raw_parts(data, len)
            };
            tensor::copy_from_bytes(bytes, dst)
        })())
    })
}

#[no_mangle]
/// # Safety
/// `data` must be valid for `len` bytes of writes (it may be null when `len` is 0).
pub unsafe extern "C" fn tvm_array_copy_to_bytes(
    src: TvmHandle,
    data: *mut u8,
    len: usize,
) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of((|| {
            let out: &mut [u8] = if len == 0 {
                &mut []
            } else if data.is_null() {
                return Err(RuntimeError::invalid("null data pointer"));
            } else {
                std::slice::from_raw_parts_mut(data, len)
            };
            tensor::copy_to_bytes(src, out)
        })())
    })
}

#[no_mangle]
pub extern "C" fn tvm_array_free(handle: TvmHandle) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || status_of(tensor::free(handle)))
}

#[no_mangle]
/// Blocks until every operation queued on the device has completed.
pub extern "C" fn tvm_synchronize(device_type: c_int, device_id: c_int) -> c_int {
    ffi_guard(TVM_ERR_NATIVE, || {
        status_of(device::synchronize(DLDevice {
            device_type,
            device_id,
        }))
    })
}

#[no_mangle]
/// Number of live handles, builtins included. `-1` on failure.
pub extern "C" fn tvm_runtime_live_handles() -> i64 {
    ffi_guard(-1, || match handles::live_count() {
        Ok(n) => n as i64,
        Err(err) => {
            status_of(Err(err));
            -1
        }
    })
}
