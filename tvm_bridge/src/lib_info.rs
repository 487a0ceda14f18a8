//! Binding of the runtime's C entry points.
//!
//! `LibInfo` mirrors the runtime surface one method per entry point: status
//! code returns and out-parameter slots, no `Result`s. The owning wrappers in
//! [`crate::function`] and [`crate::tensor`] build on top of it.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use tvmrt::abi::{
    DLDataType, DLDevice, TvmHandle, TvmPackedCFunc, TvmPackedCFuncFinalizer, TvmValue,
};
use tvmrt::TVM_ERR_INVALID_ARGUMENT;

use crate::base::{RefLong, RefValue};
use crate::callback::{self, Callback};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

#[derive(Clone, Copy)]
pub(crate) struct Symbols {
    pub get_last_error: unsafe extern "C" fn() -> *const c_char,
    pub api_set_last_error: unsafe extern "C" fn(*const c_char),
    pub free: unsafe extern "C" fn(*mut u8, usize),
    pub func_free: unsafe extern "C" fn(TvmHandle) -> c_int,
    pub object_retain: unsafe extern "C" fn(TvmHandle) -> c_int,
    pub push_arg_long: unsafe extern "C" fn(i64),
    pub push_arg_double: unsafe extern "C" fn(f64),
    pub push_arg_string: unsafe extern "C" fn(*const c_char),
    pub push_arg_bytes: unsafe extern "C" fn(*const u8, usize),
    pub push_arg_handle: unsafe extern "C" fn(TvmHandle, c_int),
    pub list_global_names: unsafe extern "C" fn(*mut *mut u8, *mut usize) -> c_int,
    pub get_global: unsafe extern "C" fn(*const c_char, *mut TvmHandle) -> c_int,
    pub register_global: unsafe extern "C" fn(*const c_char, TvmHandle, c_int) -> c_int,
    pub func_call: unsafe extern "C" fn(TvmHandle, *mut TvmValue, *mut c_int) -> c_int,
    pub create_from_cfunc: unsafe extern "C" fn(
        Option<TvmPackedCFunc>,
        *mut c_void,
        Option<TvmPackedCFuncFinalizer>,
        *mut TvmHandle,
    ) -> c_int,
    pub array_alloc: unsafe extern "C" fn(
        *const i64,
        c_int,
        c_int,
        c_int,
        c_int,
        c_int,
        c_int,
        *mut TvmHandle,
    ) -> c_int,
    pub array_get_shape: unsafe extern "C" fn(TvmHandle, *mut *mut u8, *mut usize) -> c_int,
    pub array_get_meta: unsafe extern "C" fn(TvmHandle, *mut DLDataType, *mut DLDevice) -> c_int,
    pub array_copy_from_to: unsafe extern "C" fn(TvmHandle, TvmHandle) -> c_int,
    pub array_copy_from_bytes: unsafe extern "C" fn(*const u8, usize, TvmHandle) -> c_int,
    pub array_copy_to_bytes: unsafe extern "C" fn(TvmHandle, *mut u8, usize) -> c_int,
    pub array_free: unsafe extern "C" fn(TvmHandle) -> c_int,
    pub synchronize: unsafe extern "C" fn(c_int, c_int) -> c_int,
    pub live_handles: unsafe extern "C" fn() -> i64,
}

impl Symbols {
    fn linked() -> Self {
        Self {
            get_last_error: tvmrt::tvm_get_last_error,
            api_set_last_error: tvmrt::tvm_api_set_last_error,
            free: tvmrt::tvm_free,
            func_free: tvmrt::tvm_func_free,
            object_retain: tvmrt::tvm_object_retain,
            push_arg_long: tvmrt::tvm_func_push_arg_long,
            push_arg_double: tvmrt::tvm_func_push_arg_double,
            push_arg_string: tvmrt::tvm_func_push_arg_string,
            push_arg_bytes: tvmrt::tvm_func_push_arg_bytes,
            push_arg_handle: tvmrt::tvm_func_push_arg_handle,
            list_global_names: tvmrt::tvm_func_list_global_names,
            get_global: tvmrt::tvm_func_get_global,
            register_global: tvmrt::tvm_func_register_global,
            func_call: tvmrt::tvm_func_call,
            create_from_cfunc: tvmrt::tvm_func_create_from_cfunc,
            array_alloc: tvmrt::tvm_array_alloc,
            array_get_shape: tvmrt::tvm_array_get_shape,
            array_get_meta: tvmrt::tvm_array_get_meta,
            array_copy_from_to: tvmrt::tvm_array_copy_from_to,
            array_copy_from_bytes: tvmrt::tvm_array_copy_from_bytes,
            array_copy_to_bytes: tvmrt::tvm_array_copy_to_bytes,
            array_free: tvmrt::tvm_array_free,
            synchronize: tvmrt::tvm_synchronize,
            live_handles: tvmrt::tvm_runtime_live_handles,
        }
    }

    unsafe fn load(lib: &Library) -> BridgeResult<Self> {
        macro_rules! sym {
            ($name:literal) => {
                symbol(lib, $name)?
            };
        }
        Ok(Self {
            get_last_error: sym!(b"tvm_get_last_error\0"),
            api_set_last_error: sym!(b"tvm_api_set_last_error\0"),
            free: sym!(b"tvm_free\0"),
            func_free: sym!(b"tvm_func_free\0"),
            object_retain: sym!(b"tvm_object_retain\0"),
            push_arg_long: sym!(b"tvm_func_push_arg_long\0"),
            push_arg_double: sym!(b"tvm_func_push_arg_double\0"),
            push_arg_string: sym!(b"tvm_func_push_arg_string\0"),
            push_arg_bytes: sym!(b"tvm_func_push_arg_bytes\0"),
            push_arg_handle: sym!(b"tvm_func_push_arg_handle\0"),
            list_global_names: sym!(b"tvm_func_list_global_names\0"),
            get_global: sym!(b"tvm_func_get_global\0"),
            register_global: sym!(b"tvm_func_register_global\0"),
            func_call: sym!(b"tvm_func_call\0"),
            create_from_cfunc: sym!(b"tvm_func_create_from_cfunc\0"),
            array_alloc: sym!(b"tvm_array_alloc\0"),
            array_get_shape: sym!(b"tvm_array_get_shape\0"),
            array_get_meta: sym!(b"tvm_array_get_meta\0"),
            array_copy_from_to: sym!(b"tvm_array_copy_from_to\0"),
            array_copy_from_bytes: sym!(b"tvm_array_copy_from_bytes\0"),
            array_copy_to_bytes: sym!(b"tvm_array_copy_to_bytes\0"),
            array_free: sym!(b"tvm_array_free\0"),
            synchronize: sym!(b"tvm_synchronize\0"),
            live_handles: sym!(b"tvm_runtime_live_handles\0"),
        })
    }
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> BridgeResult<T> {
    let s: libloading::Symbol<T> = lib.get(name).map_err(|e| {
        BridgeError::Library(format!(
            "load symbol {}: {}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)),
            e
        ))
    })?;
    Ok(*s)
}

/// Entry points of one runtime instance. Cheap to clone; a loaded library
/// stays mapped while any clone (or any handle wrapper built from one) lives.
#[derive(Clone)]
pub struct LibInfo {
    _lib: Option<Arc<Library>>,
    pub(crate) symbols: Symbols,
}

impl std::fmt::Debug for LibInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibInfo")
            .field("loaded", &self._lib.is_some())
            .finish()
    }
}

impl LibInfo {
    /// Binds the runtime compiled into this process.
    pub fn linked() -> Self {
        Self {
            _lib: None,
            symbols: Symbols::linked(),
        }
    }

    /// Opens the runtime shared library at `path`. No search paths are tried.
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            BridgeError::Library(format!("failed to load {}: {}", path.display(), e))
        })?;
        let symbols = unsafe { Symbols::load(&lib)? };
        tracing::debug!(path = %path.display(), "runtime library loaded");
        Ok(Self {
            _lib: Some(Arc::new(lib)),
            symbols,
        })
    }

    /// Loads `config.library` when set, otherwise binds the linked runtime.
    pub fn from_config(config: &BridgeConfig) -> BridgeResult<Self> {
        match &config.library {
            Some(path) => Self::load(path),
            None => Ok(Self::linked()),
        }
    }

    /// Records `message` in the runtime's error channel and returns `status`,
    /// for failures detected before reaching the runtime.
    fn reject(&self, status: c_int, message: &str) -> c_int {
        self.set_last_error(message);
        status
    }

    pub fn get_last_error(&self) -> String {
        let ptr = unsafe { (self.symbols.get_last_error)() };
        if ptr.is_null() {
            return "native runtime error".to_string();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    /// Records `message` as this thread's last error in the runtime.
    pub fn set_last_error(&self, message: &str) {
        let c = CString::new(message.replace('\0', " ")).unwrap_or_default();
        unsafe { (self.symbols.api_set_last_error)(c.as_ptr()) };
    }

    pub fn func_free(&self, handle: TvmHandle) -> c_int {
        unsafe { (self.symbols.func_free)(handle) }
    }

    pub fn object_retain(&self, handle: TvmHandle) -> c_int {
        unsafe { (self.symbols.object_retain)(handle) }
    }

    pub fn func_push_arg_long(&self, arg: i64) {
        unsafe { (self.symbols.push_arg_long)(arg) }
    }

    pub fn func_push_arg_double(&self, arg: f64) {
        unsafe { (self.symbols.push_arg_double)(arg) }
    }

    /// A string with an interior nul is pushed as null, which fails the next call.
    pub fn func_push_arg_string(&self, arg: &str) {
        match CString::new(arg) {
            Ok(c) => unsafe { (self.symbols.push_arg_string)(c.as_ptr()) },
            Err(_) => unsafe { (self.symbols.push_arg_string)(std::ptr::null()) },
        }
    }

    pub fn func_push_arg_bytes(&self, arg: &[u8]) {
        unsafe { (self.symbols.push_arg_bytes)(arg.as_ptr(), arg.len()) }
    }

    pub fn func_push_arg_handle(&self, arg: TvmHandle, type_code: c_int) {
        unsafe { (self.symbols.push_arg_handle)(arg, type_code) }
    }

    /// Replaces the contents of `names` with the registered global names.
    pub fn func_list_global_names(&self, names: &mut Vec<String>) -> c_int {
        let mut bytes = Vec::new();
        let rc = self.take_buffer(&mut bytes, |data, len| unsafe {
            (self.symbols.list_global_names)(data, len)
        });
        if rc != 0 {
            return rc;
        }
        match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(list) => {
                *names = list;
                0
            }
            Err(err) => self.reject(
                tvmrt::TVM_ERR_NATIVE,
                &format!("malformed name list: {}", err),
            ),
        }
    }

    pub fn func_get_global(&self, name: &str, handle: &mut RefLong) -> c_int {
        let Ok(name) = CString::new(name) else {
            return self.reject(TVM_ERR_INVALID_ARGUMENT, "function name contains a nul byte");
        };
        unsafe { (self.symbols.get_global)(name.as_ptr(), &mut handle.value) }
    }

    pub fn func_register_global(&self, name: &str, handle: TvmHandle, override_: c_int) -> c_int {
        let Ok(name) = CString::new(name) else {
            return self.reject(TVM_ERR_INVALID_ARGUMENT, "function name contains a nul byte");
        };
        unsafe { (self.symbols.register_global)(name.as_ptr(), handle, override_) }
    }

    pub fn func_call(&self, handle: TvmHandle, ret_val: &mut RefValue) -> c_int {
        let mut value = TvmValue::null();
        let mut type_code = 0;
        let rc = unsafe { (self.symbols.func_call)(handle, &mut value, &mut type_code) };
        if rc == 0 {
            ret_val.value = value;
            ret_val.type_code = type_code;
        }
        rc
    }

    /// Wraps `callback` as a native function handle.
    pub fn func_create_from_cfunc<C>(&self, callback: C, handle: &mut RefLong) -> c_int
    where
        C: Callback + 'static,
    {
        let resource = callback::into_resource(self.clone(), callback);
        let rc = unsafe {
            (self.symbols.create_from_cfunc)(
                Some(callback::trampoline),
                resource,
                Some(callback::finalize),
                &mut handle.value,
            )
        };
        if rc != 0 {
            // The runtime never took ownership.
            unsafe { callback::finalize(resource) };
        }
        rc
    }

    #[allow(clippy::too_many_arguments)]
    pub fn array_alloc(
        &self,
        shape: &[i64],
        dtype_code: c_int,
        dtype_bits: c_int,
        dtype_lanes: c_int,
        device_type: c_int,
        device_id: c_int,
        handle: &mut RefLong,
    ) -> c_int {
        let Ok(ndim) = c_int::try_from(shape.len()) else {
            return self.reject(TVM_ERR_INVALID_ARGUMENT, "too many dimensions");
        };
        unsafe {
            (self.symbols.array_alloc)(
                shape.as_ptr(),
                ndim,
                dtype_code,
                dtype_bits,
                dtype_lanes,
                device_type,
                device_id,
                &mut handle.value,
            )
        }
    }

    /// Replaces the contents of `shape` with the tensor's dimensions.
    pub fn array_get_shape(&self, handle: TvmHandle, shape: &mut Vec<i64>) -> c_int {
        let mut bytes = Vec::new();
        let rc = self.take_buffer(&mut bytes, |data, len| unsafe {
            (self.symbols.array_get_shape)(handle, data, len)
        });
        if rc != 0 {
            return rc;
        }
        match serde_json::from_slice::<Vec<i64>>(&bytes) {
            Ok(dims) => {
                *shape = dims;
                0
            }
            Err(err) => self.reject(tvmrt::TVM_ERR_NATIVE, &format!("malformed shape: {}", err)),
        }
    }

    pub fn array_get_meta(
        &self,
        handle: TvmHandle,
        dtype: &mut DLDataType,
        device: &mut DLDevice,
    ) -> c_int {
        unsafe { (self.symbols.array_get_meta)(handle, dtype, device) }
    }

    pub fn array_copy_from_to(&self, from: TvmHandle, to: TvmHandle) -> c_int {
        unsafe { (self.symbols.array_copy_from_to)(from, to) }
    }

    pub fn array_copy_from_bytes(&self, from: &[u8], to: TvmHandle) -> c_int {
        unsafe { (self.symbols.array_copy_from_bytes)(from.as_ptr(), from.len(), to) }
    }

    pub fn array_copy_to_bytes(&self, from: TvmHandle, to: &mut [u8]) -> c_int {
        unsafe { (self.symbols.array_copy_to_bytes)(from, to.as_mut_ptr(), to.len()) }
    }

    pub fn array_free(&self, handle: TvmHandle) -> c_int {
        unsafe { (self.symbols.array_free)(handle) }
    }

    pub fn synchronize(&self, device_type: c_int, device_id: c_int) -> c_int {
        unsafe { (self.symbols.synchronize)(device_type, device_id) }
    }

    /// Live handle count, or `-1` when the runtime could not report it.
    pub fn live_handles(&self) -> i64 {
        unsafe { (self.symbols.live_handles)() }
    }

    /// Runs an entry point that hands back a runtime-allocated buffer, copies
    /// it into `out` and releases it.
    fn take_buffer<F>(&self, out: &mut Vec<u8>, call: F) -> c_int
    where
        F: FnOnce(*mut *mut u8, *mut usize) -> c_int,
    {
        let mut data: *mut u8 = std::ptr::null_mut();
        let mut len = 0usize;
        let rc = call(&mut data, &mut len);
        if rc != 0 {
            return rc;
        }
        if !data.is_null() {
            *out = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
            unsafe { (self.symbols.free)(data, len) };
        }
        0
    }
}
