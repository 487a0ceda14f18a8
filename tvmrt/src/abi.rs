//! `#[repr(C)]` types shared by every entry point of the runtime.
//!
//! The encodings follow DLPack for data types and devices, and the packed
//! function type codes understood by callers of `tvm_func_push_arg_handle`.

use libc::{c_char, c_int, c_void};

/// Opaque reference to a runtime-owned object. `0` is never handed out.
pub type TvmHandle = i64;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Int = 0,
    UInt = 1,
    Float = 2,
    OpaqueHandle = 3,
    Null = 4,
    DataType = 5,
    Device = 6,
    DLTensorHandle = 7,
    ObjectHandle = 8,
    ModuleHandle = 9,
    PackedFuncHandle = 10,
    Str = 11,
    Bytes = 12,
    NDArrayHandle = 13,
}

impl TypeCode {
    pub fn from_raw(code: c_int) -> Option<Self> {
        let code = match code {
            0 => TypeCode::Int,
            1 => TypeCode::UInt,
            2 => TypeCode::Float,
            3 => TypeCode::OpaqueHandle,
            4 => TypeCode::Null,
            5 => TypeCode::DataType,
            6 => TypeCode::Device,
            7 => TypeCode::DLTensorHandle,
            8 => TypeCode::ObjectHandle,
            9 => TypeCode::ModuleHandle,
            10 => TypeCode::PackedFuncHandle,
            11 => TypeCode::Str,
            12 => TypeCode::Bytes,
            13 => TypeCode::NDArrayHandle,
            _ => return None,
        };
        Some(code)
    }

    /// Handle codes whose values live in the runtime's handle table.
    pub fn is_tracked_handle(self) -> bool {
        matches!(
            self,
            TypeCode::DLTensorHandle
                | TypeCode::ObjectHandle
                | TypeCode::PackedFuncHandle
                | TypeCode::NDArrayHandle
        )
    }

    pub fn is_handle(self) -> bool {
        self.is_tracked_handle() || matches!(self, TypeCode::OpaqueHandle | TypeCode::ModuleHandle)
    }
}

/// One packed argument or return slot. The active field is named by the
/// accompanying [`TypeCode`]; handles travel in `v_int64`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union TvmValue {
    pub v_int64: i64,
    pub v_float64: f64,
    pub v_handle: *mut c_void,
    pub v_str: *const c_char,
    pub v_type: DLDataType,
    pub v_device: DLDevice,
}

impl TvmValue {
    pub fn null() -> Self {
        TvmValue { v_int64: 0 }
    }
}

impl Default for TvmValue {
    fn default() -> Self {
        Self::null()
    }
}

/// Borrowed byte buffer passed through `TvmValue::v_handle` for `TypeCode::Bytes`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TvmByteArray {
    pub data: *const u8,
    pub size: usize,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataTypeCode {
    Int = 0,
    UInt = 1,
    Float = 2,
    BFloat = 4,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DLDataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

impl DLDataType {
    pub const fn new(code: DataTypeCode, bits: u8, lanes: u16) -> Self {
        Self {
            code: code as u8,
            bits,
            lanes,
        }
    }

    /// Bytes occupied by one element, `bits / 8 * lanes`.
    pub fn element_bytes(&self) -> usize {
        (self.bits as usize / 8) * self.lanes as usize
    }
}

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Cpu = 1,
    Cuda = 2,
    CudaHost = 3,
    OpenCl = 4,
    Vulkan = 7,
    Metal = 8,
    Rocm = 10,
    ExtDev = 12,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DLDevice {
    pub device_type: i32,
    pub device_id: i32,
}

impl DLDevice {
    pub const fn new(device_type: DeviceType, device_id: i32) -> Self {
        Self {
            device_type: device_type as i32,
            device_id,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.device_type == DeviceType::Cpu as i32
    }
}

/// Signature of a foreign function wrapped by `tvm_func_create_from_cfunc`.
///
/// The callee reads `num_args` values and codes, writes its result into
/// `ret_val`/`ret_type_code`, and returns `0` on success. On failure it should
/// record a message with `tvm_api_set_last_error` and return nonzero.
pub type TvmPackedCFunc = unsafe extern "C" fn(
    args: *const TvmValue,
    type_codes: *const c_int,
    num_args: c_int,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
    resource: *mut c_void,
) -> c_int;

/// Called once with the resource pointer when the wrapping handle is released.
pub type TvmPackedCFuncFinalizer = unsafe extern "C" fn(resource: *mut c_void);
