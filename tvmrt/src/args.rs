//! Per-thread argument stack and conversion between [`ArgValue`] and the
//! packed `TvmValue`/type-code representation.

use std::cell::RefCell;
use std::ffi::{CStr, CString};

use libc::c_int;

use crate::abi::{TvmByteArray, TvmHandle, TvmValue, TypeCode};
use crate::error::{RuntimeError, RuntimeResult};
use crate::handles;

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Handle { handle: TvmHandle, type_code: TypeCode },
}

impl ArgValue {
    pub fn type_code(&self) -> TypeCode {
        match self {
            ArgValue::Null => TypeCode::Null,
            ArgValue::Int(_) => TypeCode::Int,
            ArgValue::Float(_) => TypeCode::Float,
            ArgValue::Str(_) => TypeCode::Str,
            ArgValue::Bytes(_) => TypeCode::Bytes,
            ArgValue::Handle { type_code, .. } => *type_code,
        }
    }

    pub fn as_int(&self) -> RuntimeResult<i64> {
        match self {
            ArgValue::Int(v) => Ok(*v),
            other => Err(type_mismatch("Int", other)),
        }
    }

    pub fn as_float(&self) -> RuntimeResult<f64> {
        match self {
            ArgValue::Float(v) => Ok(*v),
            ArgValue::Int(v) => Ok(*v as f64),
            other => Err(type_mismatch("Float", other)),
        }
    }

    pub fn as_str(&self) -> RuntimeResult<&str> {
        match self {
            ArgValue::Str(s) => Ok(s),
            other => Err(type_mismatch("Str", other)),
        }
    }

    pub fn as_handle(&self) -> RuntimeResult<TvmHandle> {
        match self {
            ArgValue::Handle { handle, .. } => Ok(*handle),
            other => Err(type_mismatch("handle", other)),
        }
    }
}

fn type_mismatch(expected: &str, found: &ArgValue) -> RuntimeError {
    RuntimeError::invalid(format!(
        "expected {} argument, found {:?}",
        expected,
        found.type_code()
    ))
}

#[derive(Default)]
struct ArgStack {
    values: Vec<ArgValue>,
    poisoned: Option<String>,
}

thread_local! {
    static ARG_STACK: RefCell<ArgStack> = RefCell::new(ArgStack::default());
    static RET_STR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static RET_BYTES: RefCell<Option<(Vec<u8>, Box<TvmByteArray>)>> = const { RefCell::new(None) };
}

pub(crate) fn push(value: ArgValue) {
    ARG_STACK.with(|stack| stack.borrow_mut().values.push(value));
}

/// Marks the pending call as invalid. Pushes have no status, so a malformed
/// push is reported by the next `tvm_func_call` on this thread.
pub(crate) fn poison(reason: impl Into<String>) {
    ARG_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.poisoned.is_none() {
            stack.poisoned = Some(reason.into());
        }
    });
}

/// Empties the stack and hands back its contents.
pub(crate) fn take() -> RuntimeResult<Vec<ArgValue>> {
    let stack = ARG_STACK.with(|stack| std::mem::take(&mut *stack.borrow_mut()));
    match stack.poisoned {
        Some(reason) => Err(RuntimeError::invalid(reason)),
        None => Ok(stack.values),
    }
}

#[cfg(test)]
pub(crate) fn pending() -> usize {
    ARG_STACK.with(|stack| stack.borrow().values.len())
}

pub(crate) fn validate(args: &[ArgValue]) -> RuntimeResult<()> {
    for (idx, arg) in args.iter().enumerate() {
        if let ArgValue::Handle { handle, type_code } = arg {
            handles::check_typed(*handle, *type_code)
                .map_err(|err| RuntimeError::invalid(format!("argument {}: {}", idx, err)))?;
        }
    }
    Ok(())
}

/// Packed form of an argument list. Owns the storage the raw values point into.
pub(crate) struct Encoded {
    pub values: Vec<TvmValue>,
    pub codes: Vec<c_int>,
    _strings: Vec<CString>,
    _bytes: Vec<Box<TvmByteArray>>,
}

pub(crate) fn encode(args: &[ArgValue]) -> RuntimeResult<Encoded> {
    let mut values = Vec::with_capacity(args.len());
    let mut codes = Vec::with_capacity(args.len());
    let mut strings = Vec::new();
    let mut bytes = Vec::new();
    for arg in args {
        let value = match arg {
            ArgValue::Null => TvmValue::null(),
            ArgValue::Int(v) => TvmValue { v_int64: *v },
            ArgValue::Float(v) => TvmValue { v_float64: *v },
            ArgValue::Str(s) => {
                let c = CString::new(s.as_str())
                    .map_err(|_| RuntimeError::invalid("string argument contains a nul byte"))?;
                let value = TvmValue { v_str: c.as_ptr() };
                strings.push(c);
                value
            }
            ArgValue::Bytes(b) => {
                let array = Box::new(TvmByteArray {
                    data: b.as_ptr(),
                    size: b.len(),
                });
                let value = TvmValue {
                    v_handle: &*array as *const TvmByteArray as *mut libc::c_void,
                };
                bytes.push(array);
                value
            }
            ArgValue::Handle { handle, .. } => TvmValue { v_int64: *handle },
        };
        values.push(value);
        codes.push(arg.type_code() as c_int);
    }
    Ok(Encoded {
        values,
        codes,
        _strings: strings,
        _bytes: bytes,
    })
}

/// # Safety
/// `value` must hold the field selected by `code`; string and byte pointers must
/// be valid for reads for the duration of the call.
pub(crate) unsafe fn decode(value: TvmValue, code: c_int) -> RuntimeResult<ArgValue> {
    let type_code = TypeCode::from_raw(code)
        .ok_or_else(|| RuntimeError::invalid(format!("unknown type code {}", code)))?;
    let decoded = match type_code {
        TypeCode::Null => ArgValue::Null,
        TypeCode::Int | TypeCode::UInt => ArgValue::Int(value.v_int64),
        TypeCode::Float => ArgValue::Float(value.v_float64),
        TypeCode::Str => {
            if value.v_str.is_null() {
                return Err(RuntimeError::invalid("null string value"));
            }
            let s = CStr::from_ptr(value.v_str)
                .to_str()
                .map_err(|_| RuntimeError::invalid("string value is not valid UTF-8"))?;
            ArgValue::Str(s.to_string())
        }
        TypeCode::Bytes => {
            let array = value.v_handle as *const TvmByteArray;
            if array.is_null() {
                return Err(RuntimeError::invalid("null byte array value"));
            }
            let array = &*array;
            if array.size == 0 {
                ArgValue::Bytes(Vec::new())
            } else if array.data.is_null() {
                return Err(RuntimeError::invalid("null byte array data"));
            } else {
                ArgValue::Bytes(std::slice::from_raw_parts(array.data, array.size).to_vec())
            }
        }
        code if code.is_handle() => ArgValue::Handle {
            handle: value.v_int64,
            type_code: code,
        },
        other => {
            return Err(RuntimeError::invalid(format!(
                "type code {:?} cannot be passed by value",
                other
            )))
        }
    };
    Ok(decoded)
}

/// Writes a call result into caller-provided slots. String and byte results
/// point into thread-local storage that stays valid until the next call
/// returns on this thread.
///
/// # Safety
/// Both pointers must be valid for writes.
pub(crate) unsafe fn write_return(
    value: ArgValue,
    ret_val: *mut TvmValue,
    ret_type_code: *mut c_int,
) -> RuntimeResult<()> {
    let code = value.type_code() as c_int;
    let raw = match value {
        ArgValue::Null => TvmValue::null(),
        ArgValue::Int(v) => TvmValue { v_int64: v },
        ArgValue::Float(v) => TvmValue { v_float64: v },
        ArgValue::Str(s) => {
            let c = CString::new(s)
                .map_err(|_| RuntimeError::invalid("string result contains a nul byte"))?;
            RET_STR.with(|slot| {
                let mut slot = slot.borrow_mut();
                let ptr = c.as_ptr();
                *slot = Some(c);
                TvmValue { v_str: ptr }
            })
        }
        ArgValue::Bytes(b) => RET_BYTES.with(|slot| {
            let mut slot = slot.borrow_mut();
            let array = Box::new(TvmByteArray {
                data: b.as_ptr(),
                size: b.len(),
            });
            let ptr = &*array as *const TvmByteArray as *mut libc::c_void;
            *slot = Some((b, array));
            TvmValue { v_handle: ptr }
        }),
        ArgValue::Handle { handle, .. } => TvmValue { v_int64: handle },
    };
    *ret_val = raw;
    *ret_type_code = code;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_empties_stack_and_preserves_order() {
        push(ArgValue::Int(3));
        push(ArgValue::Int(2));
        assert_eq!(pending(), 2);
        let args = take().unwrap();
        assert_eq!(args, vec![ArgValue::Int(3), ArgValue::Int(2)]);
        assert_eq!(pending(), 0);
    }

    #[test]
    fn poisoned_stack_fails_once_then_recovers() {
        push(ArgValue::Int(1));
        poison("bad push");
        let err = take().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
        assert_eq!(pending(), 0);
        push(ArgValue::Int(1));
        assert_eq!(take().unwrap(), vec![ArgValue::Int(1)]);
    }

    #[test]
    fn encode_then_decode_preserves_values() {
        let args = vec![
            ArgValue::Int(-7),
            ArgValue::Float(1.5),
            ArgValue::Str("hi".to_string()),
            ArgValue::Bytes(vec![1, 2, 3]),
            ArgValue::Null,
        ];
        let encoded = encode(&args).unwrap();
        let decoded: Vec<ArgValue> = encoded
            .values
            .iter()
            .zip(encoded.codes.iter())
            .map(|(v, c)| unsafe { decode(*v, *c) }.unwrap())
            .collect();
        assert_eq!(decoded, args);
    }

    #[test]
    fn decode_rejects_unknown_codes() {
        let err = unsafe { decode(TvmValue::null(), 99) }.unwrap_err();
        assert!(err.to_string().contains("unknown type code"));
    }
}
