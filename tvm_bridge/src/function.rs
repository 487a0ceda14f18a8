use std::mem::ManuallyDrop;
use std::os::raw::c_int;

use tvmrt::abi::{TvmHandle, TypeCode};

use crate::base::{check_call, RefLong, RefValue};
use crate::callback::Callback;
use crate::error::{BridgeError, BridgeResult};
use crate::lib_info::LibInfo;
use crate::value::Value;

/// Owned reference to a runtime function handle, freed on drop.
#[derive(Debug)]
pub struct Function {
    handle: TvmHandle,
    lib: LibInfo,
}

impl Function {
    /// Looks up a registered global function.
    pub fn get_global(lib: &LibInfo, name: &str) -> BridgeResult<Function> {
        let mut handle = RefLong::default();
        check_call(lib, lib.func_get_global(name, &mut handle))?;
        Ok(Function {
            handle: handle.value,
            lib: lib.clone(),
        })
    }

    pub fn list_global_names(lib: &LibInfo) -> BridgeResult<Vec<String>> {
        let mut names = Vec::new();
        check_call(lib, lib.func_list_global_names(&mut names))?;
        Ok(names)
    }

    /// Wraps a managed closure as a native function handle.
    pub fn from_callback<C>(lib: &LibInfo, callback: C) -> BridgeResult<Function>
    where
        C: Callback + 'static,
    {
        let mut handle = RefLong::default();
        check_call(lib, lib.func_create_from_cfunc(callback, &mut handle))?;
        tracing::debug!(handle = handle.value, "callback wrapped");
        Ok(Function {
            handle: handle.value,
            lib: lib.clone(),
        })
    }

    /// Adopts a handle the caller holds one reference to.
    ///
    /// # Safety
    /// `handle` must be a live function handle of `lib`'s runtime, and the
    /// reference must not be freed elsewhere.
    pub unsafe fn from_raw(lib: LibInfo, handle: TvmHandle) -> Function {
        Function { handle, lib }
    }

    /// Gives up ownership without freeing the handle.
    pub fn into_raw(self) -> TvmHandle {
        let this = ManuallyDrop::new(self);
        // Drop the library binding, skip the free.
        drop(unsafe { std::ptr::read(&this.lib) });
        this.handle
    }

    pub fn handle(&self) -> TvmHandle {
        self.handle
    }

    pub fn lib(&self) -> &LibInfo {
        &self.lib
    }

    /// Binds this function under `name`. The registry takes its own reference.
    pub fn register(&self, name: &str, override_existing: bool) -> BridgeResult<()> {
        let rc = self
            .lib
            .func_register_global(name, self.handle, override_existing as c_int);
        check_call(&self.lib, rc)
    }

    /// Appends one argument to this thread's pending call.
    pub fn push_arg(&self, arg: &Value) -> BridgeResult<&Self> {
        check_pushable(arg)?;
        push(&self.lib, arg);
        Ok(self)
    }

    /// Calls with whatever was pushed on this thread since the last call.
    pub fn invoke(&self) -> BridgeResult<Value> {
        let mut ret = RefValue::default();
        check_call(&self.lib, self.lib.func_call(self.handle, &mut ret))?;
        unsafe { Value::from_raw(&self.lib, ret.value, ret.type_code, true) }
    }

    pub fn call(&self, args: &[Value]) -> BridgeResult<Value> {
        for arg in args {
            check_pushable(arg)?;
        }
        for arg in args {
            push(&self.lib, arg);
        }
        self.invoke()
    }
}

impl Drop for Function {
    fn drop(&mut self) {
        let rc = self.lib.func_free(self.handle);
        if rc != 0 {
            tracing::warn!(
                handle = self.handle,
                "failed to free function: {}",
                self.lib.get_last_error()
            );
        }
    }
}

fn check_pushable(arg: &Value) -> BridgeResult<()> {
    match arg {
        Value::Null => Err(BridgeError::InvalidArgument(
            "null has no push entry point".into(),
        )),
        _ => Ok(()),
    }
}

fn push(lib: &LibInfo, arg: &Value) {
    match arg {
        Value::Null => {}
        Value::Int(v) => lib.func_push_arg_long(*v),
        Value::Float(v) => lib.func_push_arg_double(*v),
        Value::Str(s) => lib.func_push_arg_string(s),
        Value::Bytes(b) => lib.func_push_arg_bytes(b),
        Value::Handle { handle, type_code } => lib.func_push_arg_handle(*handle, *type_code as c_int),
        Value::Function(f) => {
            lib.func_push_arg_handle(f.handle(), TypeCode::PackedFuncHandle as c_int)
        }
        Value::NDArray(a) => lib.func_push_arg_handle(a.handle(), TypeCode::NDArrayHandle as c_int),
    }
}
