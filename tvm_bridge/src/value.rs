use std::ffi::CStr;
use std::os::raw::c_int;

use tvmrt::abi::{DLDataType, DLDevice, TvmByteArray, TvmHandle, TvmValue, TypeCode};

use crate::base::check_call;
use crate::error::{BridgeError, BridgeResult};
use crate::function::Function;
use crate::lib_info::LibInfo;
use crate::tensor::NDArray;

/// Argument or result of a packed call.
///
/// `Function` and `NDArray` own a runtime reference and release it on drop.
/// `Handle` is a raw value the bridge does not track (opaque pointers, module
/// handles).
#[derive(Debug)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Handle { handle: TvmHandle, type_code: TypeCode },
    Function(Function),
    NDArray(NDArray),
}

impl Value {
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Null => TypeCode::Null,
            Value::Int(_) => TypeCode::Int,
            Value::Float(_) => TypeCode::Float,
            Value::Str(_) => TypeCode::Str,
            Value::Bytes(_) => TypeCode::Bytes,
            Value::Handle { type_code, .. } => *type_code,
            Value::Function(_) => TypeCode::PackedFuncHandle,
            Value::NDArray(_) => TypeCode::NDArrayHandle,
        }
    }

    pub fn as_int(&self) -> BridgeResult<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(mismatch("Int", other)),
        }
    }

    pub fn as_float(&self) -> BridgeResult<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(mismatch("Float", other)),
        }
    }

    pub fn as_str(&self) -> BridgeResult<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("Str", other)),
        }
    }

    pub fn as_bytes(&self) -> BridgeResult<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch("Bytes", other)),
        }
    }

    pub fn into_function(self) -> BridgeResult<Function> {
        match self {
            Value::Function(f) => Ok(f),
            other => Err(mismatch("PackedFuncHandle", &other)),
        }
    }

    pub fn into_ndarray(self) -> BridgeResult<NDArray> {
        match self {
            Value::NDArray(a) => Ok(a),
            other => Err(mismatch("NDArrayHandle", &other)),
        }
    }

    /// Converts a raw slot written by the runtime. When `owned` is false the
    /// slot only borrows its handle, so tracked handles are retained first.
    ///
    /// # Safety
    /// `raw` must hold the field selected by `type_code`, with string and byte
    /// pointers still valid.
    pub(crate) unsafe fn from_raw(
        lib: &LibInfo,
        raw: TvmValue,
        type_code: c_int,
        owned: bool,
    ) -> BridgeResult<Value> {
        let code = TypeCode::from_raw(type_code).ok_or_else(|| {
            BridgeError::InvalidArgument(format!("unknown type code {}", type_code))
        })?;
        let value = match code {
            TypeCode::Null => Value::Null,
            TypeCode::Int | TypeCode::UInt => Value::Int(raw.v_int64),
            TypeCode::Float => Value::Float(raw.v_float64),
            TypeCode::Str => {
                if raw.v_str.is_null() {
                    return Err(BridgeError::InvalidArgument("null string value".into()));
                }
                Value::Str(CStr::from_ptr(raw.v_str).to_string_lossy().into_owned())
            }
            TypeCode::Bytes => {
                let array = raw.v_handle as *const TvmByteArray;
                if array.is_null() {
                    return Err(BridgeError::InvalidArgument("null byte array value".into()));
                }
                let array = &*array;
                if array.size == 0 {
                    Value::Bytes(Vec::new())
                } else if array.data.is_null() {
                    return Err(BridgeError::InvalidArgument("null byte array data".into()));
                } else {
                    Value::Bytes(std::slice::from_raw_parts(array.data, array.size).to_vec())
                }
            }
            code if code.is_tracked_handle() => {
                let handle = raw.v_int64;
                if !owned {
                    check_call(lib, lib.object_retain(handle))?;
                }
                adopt(lib, handle, code)?
            }
            code if code.is_handle() => Value::Handle {
                handle: raw.v_int64,
                type_code: code,
            },
            other => {
                return Err(BridgeError::InvalidArgument(format!(
                    "type code {:?} has no managed representation",
                    other
                )))
            }
        };
        Ok(value)
    }
}

/// Wraps an owned reference to a tracked handle. Generic object handles are
/// resolved by asking the runtime whether they name a tensor.
fn adopt(lib: &LibInfo, handle: TvmHandle, code: TypeCode) -> BridgeResult<Value> {
    let mut dtype = DLDataType {
        code: 0,
        bits: 0,
        lanes: 0,
    };
    let mut device = DLDevice {
        device_type: 0,
        device_id: 0,
    };
    match code {
        TypeCode::PackedFuncHandle => Ok(Value::Function(unsafe {
            Function::from_raw(lib.clone(), handle)
        })),
        _ => {
            // The meta lookup fails for functions; keep the caller's last error.
            let saved = lib.get_last_error();
            let rc = lib.array_get_meta(handle, &mut dtype, &mut device);
            if rc == 0 {
                Ok(Value::NDArray(unsafe {
                    NDArray::from_raw(lib.clone(), handle, dtype, device)
                }))
            } else if code == TypeCode::ObjectHandle {
                lib.set_last_error(&saved);
                Ok(Value::Function(unsafe {
                    Function::from_raw(lib.clone(), handle)
                }))
            } else {
                // Tensor-coded but not a tensor: the only other kind is a
                // function, so give our reference back through that path.
                let err = BridgeError::from_status(rc, lib.get_last_error());
                lib.func_free(handle);
                Err(err)
            }
        }
    }
}

fn mismatch(expected: &str, found: &Value) -> BridgeError {
    BridgeError::InvalidArgument(format!(
        "expected {} value, found {:?}",
        expected,
        found.type_code()
    ))
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Function> for Value {
    fn from(v: Function) -> Self {
        Value::Function(v)
    }
}

impl From<NDArray> for Value {
    fn from(v: NDArray) -> Self {
        Value::NDArray(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_with_null_data_are_rejected() {
        let lib = LibInfo::linked();
        let array = TvmByteArray {
            data: std::ptr::null(),
            size: 3,
        };
        let raw = TvmValue {
            v_handle: &array as *const TvmByteArray as *mut std::os::raw::c_void,
        };
        let err = unsafe { Value::from_raw(&lib, raw, TypeCode::Bytes as c_int, true) }
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)), "{:?}", err);

        let empty = TvmByteArray {
            data: std::ptr::null(),
            size: 0,
        };
        let raw = TvmValue {
            v_handle: &empty as *const TvmByteArray as *mut std::os::raw::c_void,
        };
        let value = unsafe { Value::from_raw(&lib, raw, TypeCode::Bytes as c_int, true) }.unwrap();
        assert_eq!(value.as_bytes().unwrap(), &[] as &[u8]);
    }
}
