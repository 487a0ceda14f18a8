//! Global function registry and the packed calling convention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use libc::{c_int, c_void};
use once_cell::sync::Lazy;

use crate::abi::{TvmHandle, TvmPackedCFunc, TvmPackedCFuncFinalizer, TvmValue, TypeCode};
use crate::args::{self, ArgValue};
use crate::error::{self, RuntimeError, RuntimeResult};
use crate::handles::{self, HandleKind, Object};

/// A callable stored behind a function handle. Results that are tracked
/// handles carry a reference owned by the caller.
pub type PackedFunc = Arc<dyn Fn(&[ArgValue]) -> RuntimeResult<ArgValue> + Send + Sync>;

/// Foreign function plus the resource it closes over.
struct CFunc {
    func: TvmPackedCFunc,
    resource: *mut c_void,
    finalizer: Option<TvmPackedCFuncFinalizer>,
}

// The resource is only touched through `func` and `finalizer`, which the
// creator promises are callable from any thread.
unsafe impl Send for CFunc {}
unsafe impl Sync for CFunc {}

impl CFunc {
    fn invoke(&self, args: &[ArgValue]) -> RuntimeResult<ArgValue> {
        let encoded = args::encode(args)?;
        let mut ret_val = TvmValue::null();
        let mut ret_code = TypeCode::Null as c_int;
        // Foreign code reports failures through the same slot; success must
        // leave the caller's previous message in place.
        let saved = error::take_error();
        let rc = unsafe {
            (self.func)(
                encoded.values.as_ptr(),
                encoded.codes.as_ptr(),
                encoded.values.len() as c_int,
                &mut ret_val,
                &mut ret_code,
                self.resource,
            )
        };
        if rc != 0 {
            let message = error::last_error_message()
                .unwrap_or_else(|| format!("packed C function returned status {}", rc));
            return Err(RuntimeError::from_status(rc, message));
        }
        error::restore_error(saved);
        unsafe { args::decode(ret_val, ret_code) }
    }
}

impl Drop for CFunc {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer {
            unsafe { finalizer(self.resource) };
        }
    }
}

static GLOBALS: Lazy<Mutex<HashMap<String, TvmHandle>>> =
    Lazy::new(|| Mutex::new(builtin_globals()));

fn globals() -> RuntimeResult<MutexGuard<'static, HashMap<String, TvmHandle>>> {
    GLOBALS
        .lock()
        .map_err(|_| RuntimeError::native("function registry poisoned"))
}

pub(crate) fn create(func: PackedFunc) -> RuntimeResult<TvmHandle> {
    handles::insert(Object::Function(func))
}

pub(crate) fn create_from_cfunc(
    func: TvmPackedCFunc,
    resource: *mut c_void,
    finalizer: Option<TvmPackedCFuncFinalizer>,
) -> RuntimeResult<TvmHandle> {
    let cfunc = CFunc {
        func,
        resource,
        finalizer,
    };
    create(Arc::new(move |args: &[ArgValue]| cfunc.invoke(args)))
}

/// Sorted snapshot of the registered names.
pub(crate) fn list_names() -> RuntimeResult<Vec<String>> {
    let mut names: Vec<String> = globals()?.keys().cloned().collect();
    names.sort();
    Ok(names)
}

/// Resolves `name` to its handle and adds a reference for the caller.
pub(crate) fn get(name: &str) -> RuntimeResult<TvmHandle> {
    let guard = globals()?;
    let handle = *guard
        .get(name)
        .ok_or_else(|| {
            RuntimeError::NotFound(format!("global function `{}` is not registered", name))
        })?;
    handles::retain(handle)?;
    Ok(handle)
}

/// Binds `name` to `handle`. The registry keeps its own reference; the
/// caller's reference to `handle` and to any replaced binding is untouched.
pub(crate) fn register(name: &str, handle: TvmHandle, allow_override: bool) -> RuntimeResult<()> {
    if name.is_empty() {
        return Err(RuntimeError::invalid("global function name must not be empty"));
    }
    handles::function(handle)?;
    let replaced = {
        let mut guard = globals()?;
        if guard.contains_key(name) && !allow_override {
            return Err(RuntimeError::AlreadyExists(format!(
                "global function `{}` is already registered",
                name
            )));
        }
        handles::retain(handle)?;
        guard.insert(name.to_string(), handle)
    };
    if let Some(old) = replaced {
        tracing::debug!(name, old, new = handle, "global function overridden");
        handles::release(old, Some(HandleKind::Function))?;
    }
    Ok(())
}

pub(crate) fn call(handle: TvmHandle, args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    let func = handles::function(handle)?;
    args::validate(args)?;
    func(args)
}

fn builtin_globals() -> HashMap<String, TvmHandle> {
    let builtins: Vec<(&str, PackedFunc)> = vec![
        ("testing.add", Arc::new(builtin_add) as PackedFunc),
        ("testing.sub", Arc::new(builtin_sub) as PackedFunc),
        ("testing.echo", Arc::new(builtin_echo) as PackedFunc),
        ("testing.concat", Arc::new(builtin_concat) as PackedFunc),
        ("runtime.NumArgs", Arc::new(builtin_num_args) as PackedFunc),
        ("runtime.TensorNBytes", Arc::new(builtin_tensor_nbytes) as PackedFunc),
    ];
    let mut map = HashMap::new();
    for (name, func) in builtins {
        match create(func) {
            Ok(handle) => {
                map.insert(name.to_string(), handle);
            }
            Err(err) => tracing::error!(name, "failed to register builtin: {}", err),
        }
    }
    map
}

fn expect_arity(name: &str, args: &[ArgValue], n: usize) -> RuntimeResult<()> {
    if args.len() != n {
        return Err(RuntimeError::invalid(format!(
            "{} expects {} arguments, got {}",
            name,
            n,
            args.len()
        )));
    }
    Ok(())
}

fn builtin_add(args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    expect_arity("testing.add", args, 2)?;
    match (&args[0], &args[1]) {
        (ArgValue::Int(a), ArgValue::Int(b)) => Ok(ArgValue::Int(a.wrapping_add(*b))),
        (a, b) => Ok(ArgValue::Float(a.as_float()? + b.as_float()?)),
    }
}

fn builtin_sub(args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    expect_arity("testing.sub", args, 2)?;
    match (&args[0], &args[1]) {
        (ArgValue::Int(a), ArgValue::Int(b)) => Ok(ArgValue::Int(a.wrapping_sub(*b))),
        (a, b) => Ok(ArgValue::Float(a.as_float()? - b.as_float()?)),
    }
}

fn builtin_echo(args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    expect_arity("testing.echo", args, 1)?;
    let value = args[0].clone();
    if let ArgValue::Handle { handle, type_code } = &value {
        if type_code.is_tracked_handle() {
            handles::retain(*handle)?;
        }
    }
    Ok(value)
}

fn builtin_concat(args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    let mut out = String::new();
    for arg in args {
        out.push_str(arg.as_str()?);
    }
    Ok(ArgValue::Str(out))
}

fn builtin_num_args(args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    Ok(ArgValue::Int(args.len() as i64))
}

fn builtin_tensor_nbytes(args: &[ArgValue]) -> RuntimeResult<ArgValue> {
    expect_arity("runtime.TensorNBytes", args, 1)?;
    let entry = handles::tensor(args[0].as_handle()?)?;
    Ok(ArgValue::Int(entry.nbytes() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let names = list_names().unwrap();
        for name in ["testing.add", "testing.sub", "testing.echo", "runtime.NumArgs"] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
        }
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn sub_respects_argument_order() {
        let h = get("testing.sub").unwrap();
        let out = call(h, &[ArgValue::Int(3), ArgValue::Int(2)]).unwrap();
        assert_eq!(out, ArgValue::Int(1));
        let out = call(h, &[ArgValue::Int(2), ArgValue::Int(3)]).unwrap();
        assert_eq!(out, ArgValue::Int(-1));
        handles::release(h, Some(HandleKind::Function)).unwrap();
    }

    #[test]
    fn add_mixes_int_and_float() {
        let out = builtin_add(&[ArgValue::Int(1), ArgValue::Float(0.5)]).unwrap();
        assert_eq!(out, ArgValue::Float(1.5));
        assert!(builtin_add(&[ArgValue::Int(1)]).is_err());
    }

    #[test]
    fn register_rejects_non_function_handles() {
        let err = register("testing.bogus", i64::MAX, false).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }
}
