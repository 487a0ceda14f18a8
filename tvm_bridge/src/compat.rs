//! Legacy `tvmFFI*` entry points expressed on top of the current surface.
//!
//! Every method forwards to exactly one [`LibInfo`] method with the same
//! arguments and returns its status unchanged. Device pushes have no native
//! counterpart and are dropped with a warning.

use std::os::raw::c_int;

use tvmrt::abi::{DLDevice, TvmHandle};

use crate::base::{RefLong, RefValue};
use crate::callback::Callback;
use crate::lib_info::LibInfo;

/// What became of a push request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// No native entry point exists; nothing was added to the stack.
    Ignored,
}

/// Legacy name paired with the runtime export it maps to.
pub const LEGACY_ENTRY_POINTS: &[(&str, Option<&str>)] = &[
    ("tvmFFIGetLastError", Some("tvm_get_last_error")),
    ("tvmFFIObjectFree", Some("tvm_func_free")),
    ("tvmFFIFunctionPushArgLong", Some("tvm_func_push_arg_long")),
    ("tvmFFIFunctionPushArgDouble", Some("tvm_func_push_arg_double")),
    ("tvmFFIFunctionPushArgString", Some("tvm_func_push_arg_string")),
    ("tvmFFIFunctionPushArgBytes", Some("tvm_func_push_arg_bytes")),
    ("tvmFFIFunctionPushArgHandle", Some("tvm_func_push_arg_handle")),
    ("tvmFFIFunctionPushArgDevice", None),
    ("tvmFFIFunctionListGlobalNames", Some("tvm_func_list_global_names")),
    ("tvmFFIFunctionGetGlobal", Some("tvm_func_get_global")),
    ("tvmFFIFunctionSetGlobal", Some("tvm_func_register_global")),
    ("tvmFFIFunctionCall", Some("tvm_func_call")),
    ("tvmFFIFunctionCreateFromCallback", Some("tvm_func_create_from_cfunc")),
    ("tvmFFIDLTensorGetShape", Some("tvm_array_get_shape")),
    ("tvmFFIDLTensorCopyFromTo", Some("tvm_array_copy_from_to")),
    ("tvmFFIDLTensorCopyFromJArray", Some("tvm_array_copy_from_bytes")),
    ("tvmFFIDLTensorCopyToJArray", Some("tvm_array_copy_to_bytes")),
    ("tvmTensorEmpty", Some("tvm_array_alloc")),
];

/// `Some(None)` for a known legacy name without a counterpart, `None` for an
/// unknown name.
pub fn current_entry_point(legacy: &str) -> Option<Option<&'static str>> {
    LEGACY_ENTRY_POINTS
        .iter()
        .find(|(name, _)| *name == legacy)
        .map(|(_, current)| *current)
}

pub trait LegacyLibInfo {
    fn ffi_get_last_error(&self) -> String;
    /// Releases a function handle; tensors go through `tvm_array_free`.
    fn ffi_object_free(&self, handle: TvmHandle) -> c_int;
    fn ffi_function_push_arg_long(&self, arg: i64);
    fn ffi_function_push_arg_double(&self, arg: f64);
    fn ffi_function_push_arg_string(&self, arg: &str);
    fn ffi_function_push_arg_bytes(&self, arg: &[u8]);
    fn ffi_function_push_arg_handle(&self, arg: TvmHandle, type_code: c_int);
    fn ffi_function_push_arg_device(&self, device: &DLDevice) -> PushOutcome;
    fn ffi_function_list_global_names(&self, names: &mut Vec<String>) -> c_int;
    fn ffi_function_get_global(&self, name: &str, handle: &mut RefLong) -> c_int;
    fn ffi_function_set_global(&self, name: &str, handle: TvmHandle, override_: c_int) -> c_int;
    fn ffi_function_call(&self, handle: TvmHandle, ret_val: &mut RefValue) -> c_int;
    fn ffi_function_create_from_callback<C>(&self, callback: C, handle: &mut RefLong) -> c_int
    where
        C: Callback + 'static;
    fn ffi_dltensor_get_shape(&self, handle: TvmHandle, shape: &mut Vec<i64>) -> c_int;
    fn ffi_dltensor_copy_from_to(&self, from: TvmHandle, to: TvmHandle) -> c_int;
    fn ffi_dltensor_copy_from_jarray(&self, from: &[u8], to: TvmHandle) -> c_int;
    fn ffi_dltensor_copy_to_jarray(&self, from: TvmHandle, to: &mut [u8]) -> c_int;
    #[allow(clippy::too_many_arguments)]
    fn tensor_empty(
        &self,
        shape: &[i64],
        dtype_code: c_int,
        dtype_bits: c_int,
        dtype_lanes: c_int,
        device_type: c_int,
        device_id: c_int,
        handle: &mut RefLong,
    ) -> c_int;
}

impl LegacyLibInfo for LibInfo {
    fn ffi_get_last_error(&self) -> String {
        self.get_last_error()
    }

    fn ffi_object_free(&self, handle: TvmHandle) -> c_int {
        self.func_free(handle)
    }

    fn ffi_function_push_arg_long(&self, arg: i64) {
        self.func_push_arg_long(arg)
    }

    fn ffi_function_push_arg_double(&self, arg: f64) {
        self.func_push_arg_double(arg)
    }

    fn ffi_function_push_arg_string(&self, arg: &str) {
        self.func_push_arg_string(arg)
    }

    fn ffi_function_push_arg_bytes(&self, arg: &[u8]) {
        self.func_push_arg_bytes(arg)
    }

    fn ffi_function_push_arg_handle(&self, arg: TvmHandle, type_code: c_int) {
        self.func_push_arg_handle(arg, type_code)
    }

    fn ffi_function_push_arg_device(&self, device: &DLDevice) -> PushOutcome {
        tracing::warn!(
            device_type = device.device_type,
            device_id = device.device_id,
            "device arguments have no runtime entry point; push ignored"
        );
        PushOutcome::Ignored
    }

    fn ffi_function_list_global_names(&self, names: &mut Vec<String>) -> c_int {
        self.func_list_global_names(names)
    }

    fn ffi_function_get_global(&self, name: &str, handle: &mut RefLong) -> c_int {
        self.func_get_global(name, handle)
    }

    fn ffi_function_set_global(&self, name: &str, handle: TvmHandle, override_: c_int) -> c_int {
        self.func_register_global(name, handle, override_)
    }

    fn ffi_function_call(&self, handle: TvmHandle, ret_val: &mut RefValue) -> c_int {
        self.func_call(handle, ret_val)
    }

    fn ffi_function_create_from_callback<C>(&self, callback: C, handle: &mut RefLong) -> c_int
    where
        C: Callback + 'static,
    {
        self.func_create_from_cfunc(callback, handle)
    }

    fn ffi_dltensor_get_shape(&self, handle: TvmHandle, shape: &mut Vec<i64>) -> c_int {
        self.array_get_shape(handle, shape)
    }

    fn ffi_dltensor_copy_from_to(&self, from: TvmHandle, to: TvmHandle) -> c_int {
        self.array_copy_from_to(from, to)
    }

    fn ffi_dltensor_copy_from_jarray(&self, from: &[u8], to: TvmHandle) -> c_int {
        self.array_copy_from_bytes(from, to)
    }

    fn ffi_dltensor_copy_to_jarray(&self, from: TvmHandle, to: &mut [u8]) -> c_int {
        self.array_copy_to_bytes(from, to)
    }

    fn tensor_empty(
        &self,
        shape: &[i64],
        dtype_code: c_int,
        dtype_bits: c_int,
        dtype_lanes: c_int,
        device_type: c_int,
        device_id: c_int,
        handle: &mut RefLong,
    ) -> c_int {
        self.array_alloc(
            shape,
            dtype_code,
            dtype_bits,
            dtype_lanes,
            device_type,
            device_id,
            handle,
        )
    }
}
